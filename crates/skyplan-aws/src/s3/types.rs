//! Response documents and request items of the object-store API

use serde::{Deserialize, Serialize};
use skyplan_core::{Result, SkyError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSummary {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Size", default)]
    pub size: u64,
    #[serde(rename = "ETag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(rename = "LastModified", default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

/// ListObjectsV2 page
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListBucketResult {
    #[serde(rename = "IsTruncated", default)]
    pub is_truncated: bool,
    #[serde(rename = "Contents", default)]
    pub contents: Vec<ObjectSummary>,
    #[serde(rename = "NextContinuationToken", default)]
    pub next_continuation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ObjectVersion {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "VersionId")]
    pub version_id: String,
    #[serde(rename = "IsLatest", default)]
    pub is_latest: bool,
    #[serde(rename = "Size", default)]
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeleteMarkerEntry {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "VersionId")]
    pub version_id: String,
    #[serde(rename = "IsLatest", default)]
    pub is_latest: bool,
}

/// ListObjectVersions page; versions and markers interleave in the document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListVersionsResult {
    #[serde(rename = "IsTruncated", default)]
    pub is_truncated: bool,
    #[serde(rename = "NextKeyMarker", default)]
    pub next_key_marker: Option<String>,
    #[serde(rename = "NextVersionIdMarker", default)]
    pub next_version_id_marker: Option<String>,
    #[serde(rename = "Version", default)]
    pub versions: Vec<ObjectVersion>,
    #[serde(rename = "DeleteMarker", default)]
    pub delete_markers: Vec<DeleteMarkerEntry>,
}

impl ListVersionsResult {
    /// `(key-marker, version-id-marker)` for the following page, `None` on the last page.
    ///
    /// A truncated page carrying neither marker would restart the listing from the top.
    pub fn next_markers(&self) -> Result<Option<(Option<String>, Option<String>)>> {
        if !self.is_truncated {
            return Ok(None);
        }
        if self.next_key_marker.is_none() && self.next_version_id_marker.is_none() {
            return Err(SkyError::Serialization(
                "truncated ListObjectVersions page has no NextKeyMarker or NextVersionIdMarker"
                    .to_string(),
            ));
        }
        Ok(Some((
            self.next_key_marker.clone(),
            self.next_version_id_marker.clone(),
        )))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteError {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "VersionId", default)]
    pub version_id: Option<String>,
    #[serde(rename = "Code", default)]
    pub code: String,
    #[serde(rename = "Message", default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteResult {
    #[serde(rename = "Error", default)]
    pub errors: Vec<DeleteError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitiateMultipartUploadResult {
    #[serde(rename = "UploadId")]
    pub upload_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CopyPartResult {
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// `(key, versionId?)` entry of a DeleteObjects batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectIdentifier {
    pub key: String,
    pub version_id: Option<String>,
}

impl ObjectIdentifier {
    pub fn current(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version_id: None,
        }
    }

    pub fn version(key: impl Into<String>, version_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version_id: Some(version_id.into()),
        }
    }
}

impl std::fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.version_id {
            Some(version) => write!(f, "{} ({})", self.key, version),
            None => write!(f, "{}", self.key),
        }
    }
}

/// HeadObject result
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectMeta {
    pub size: u64,
    pub etag: Option<String>,
    pub content_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::from_xml;

    #[test]
    fn test_interleaved_versions_and_markers() {
        let page: ListVersionsResult = from_xml(
            r#"<ListVersionsResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
                <Name>b</Name>
                <IsTruncated>true</IsTruncated>
                <NextKeyMarker>b</NextKeyMarker>
                <NextVersionIdMarker>v9</NextVersionIdMarker>
                <Version><Key>a</Key><VersionId>v1</VersionId><IsLatest>false</IsLatest><Size>3</Size></Version>
                <DeleteMarker><Key>a</Key><VersionId>vM</VersionId><IsLatest>true</IsLatest></DeleteMarker>
                <Version><Key>a</Key><VersionId>v2</VersionId><IsLatest>false</IsLatest><Size>4</Size></Version>
            </ListVersionsResult>"#,
        )
        .unwrap();
        assert!(page.is_truncated);
        assert_eq!(page.versions.len(), 2);
        assert_eq!(page.delete_markers.len(), 1);
        assert_eq!(page.next_version_id_marker.as_deref(), Some("v9"));
    }

    #[test]
    fn test_next_markers() {
        let last = ListVersionsResult::default();
        assert!(last.next_markers().unwrap().is_none());

        let key_only = ListVersionsResult {
            is_truncated: true,
            next_key_marker: Some("k".to_string()),
            ..Default::default()
        };
        assert_eq!(
            key_only.next_markers().unwrap(),
            Some((Some("k".to_string()), None))
        );

        let stuck = ListVersionsResult {
            is_truncated: true,
            ..Default::default()
        };
        assert!(matches!(stuck.next_markers(), Err(SkyError::Serialization(_))));
    }

    #[test]
    fn test_list_page() {
        let page: ListBucketResult = from_xml(
            r#"<ListBucketResult><IsTruncated>false</IsTruncated>
                <Contents><Key>a b</Key><Size>10</Size><ETag>&quot;abc&quot;</ETag></Contents>
                <KeyCount>1</KeyCount></ListBucketResult>"#,
        )
        .unwrap();
        assert!(!page.is_truncated);
        assert_eq!(page.contents[0].key, "a b");
        assert_eq!(page.contents[0].etag.as_deref(), Some("\"abc\""));
        assert!(page.next_continuation_token.is_none());
    }
}
