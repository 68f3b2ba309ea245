use std::collections::HashMap;

use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, HeaderValue, RANGE};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use url::Url;

use crate::http::{CallRequest, CallResponse, RobustHttp, TransportError};

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_PAGE_SIZE: u32 = 200;
const CHUNK_PUT_ATTEMPTS: u32 = 12;

pub const LISTING_FIELDS: &[&str] = &["id", "name", "size", "folder", "file", "hashes"];
pub const FOLDER_FIELDS: &[&str] = &["id", "name", "folder"];
const FILE_FIELDS: &[&str] = &["id", "name", "size", "file", "hashes"];

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("malformed response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
    #[error("path collision: a file named '{name}' exists at the destination")]
    PathCollision { name: String },
    #[error("api returned {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Transport(err) => err.status(),
            ApiError::UnexpectedStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Destination names cannot contain `/`; blank names become `_`.
pub fn clean_name(name: &str) -> String {
    let cleaned = name.replace('/', "_");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Clone)]
pub struct DriveClient {
    http: RobustHttp,
    base_url: Url,
    page_size: u32,
}

impl DriveClient {
    pub fn new(http: RobustHttp) -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL, http)
    }

    pub fn with_base_url(base_url: &str, http: RobustHttp) -> Result<Self, ApiError> {
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn http(&self) -> &RobustHttp {
        &self.http
    }

    pub async fn get_drive_root_id(&self, drive: &str) -> Result<String, ApiError> {
        let mut url = self.item_url(drive, "root", &[])?;
        url.query_pairs_mut().append_pair("$select", "id");
        let response = self.http.call(&CallRequest::get(url)).await?;
        Ok(response.json::<DriveItem>()?.id)
    }

    /// First page of `parent`'s children, requested in ascending name order.
    pub fn children_url(&self, drive: &str, parent: &str, fields: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.item_url(drive, parent, &["children"])?;
        url.query_pairs_mut()
            .append_pair("$top", &self.page_size.to_string())
            .append_pair("$select", &fields.join(","))
            .append_pair("$orderby", "name");
        Ok(url)
    }

    pub async fn list_children_page(&self, page_url: &Url) -> Result<ChildPage, ApiError> {
        let response = self.http.call(&CallRequest::get(page_url.clone())).await?;
        Ok(response.json::<ChildPage>()?)
    }

    pub async fn list_children_all(
        &self,
        drive: &str,
        parent: &str,
        fields: &[&str],
    ) -> Result<Vec<DriveItem>, ApiError> {
        let mut next = Some(self.children_url(drive, parent, fields)?);
        let mut items = Vec::new();
        while let Some(url) = next {
            let page = self.list_children_page(&url).await?;
            items.extend(page.items);
            next = page.next_link;
        }
        Ok(items)
    }

    /// Files (not folders) directly under `parent`, keyed by name.
    pub async fn list_files_map(
        &self,
        drive: &str,
        parent: &str,
    ) -> Result<HashMap<String, RemoteFile>, ApiError> {
        Ok(self
            .list_children_all(drive, parent, LISTING_FIELDS)
            .await?
            .into_iter()
            .filter(|item| !item.is_folder())
            .map(|item| {
                let file = item.to_remote_file();
                (item.name, file)
            })
            .collect())
    }

    /// Child folders of `parent` as `(name, id)` pairs in name order.
    pub async fn list_folders(
        &self,
        drive: &str,
        parent: &str,
    ) -> Result<Vec<(String, String)>, ApiError> {
        Ok(self
            .list_children_all(drive, parent, FOLDER_FIELDS)
            .await?
            .into_iter()
            .filter(DriveItem::is_folder)
            .map(|item| (item.name, item.id))
            .collect())
    }

    /// Name-addressed probe; `None` when nothing of that name exists.
    pub async fn get_child(
        &self,
        drive: &str,
        parent: &str,
        name: &str,
        fields: &[&str],
    ) -> Result<Option<DriveItem>, ApiError> {
        let mut url = self.child_path_url(drive, parent, name, &[])?;
        url.query_pairs_mut().append_pair("$select", &fields.join(","));
        let response = self
            .http
            .call(&CallRequest::get(url).accept(StatusCode::NOT_FOUND))
            .await?;
        if response.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.json::<DriveItem>()?))
    }

    pub async fn try_get_file(
        &self,
        drive: &str,
        parent: &str,
        name: &str,
    ) -> Result<Option<RemoteFile>, ApiError> {
        Ok(self
            .get_child(drive, parent, name, FILE_FIELDS)
            .await?
            .filter(|item| !item.is_folder())
            .map(|item| item.to_remote_file()))
    }

    pub async fn find_child_folder(
        &self,
        drive: &str,
        parent: &str,
        name: &str,
    ) -> Result<Option<String>, ApiError> {
        Ok(self
            .get_child(drive, parent, name, FOLDER_FIELDS)
            .await?
            .filter(DriveItem::is_folder)
            .map(|item| item.id))
    }

    /// Returns the id of the folder `name` under `parent`, creating it when
    /// absent. Fails when a file already occupies the name.
    pub async fn ensure_folder(
        &self,
        drive: &str,
        parent: &str,
        name: &str,
    ) -> Result<String, ApiError> {
        if let Some(item) = self.get_child(drive, parent, name, FOLDER_FIELDS).await? {
            return folder_id_or_collision(item, name);
        }

        let url = self.item_url(drive, parent, &["children"])?;
        let body = json!({
            "name": clean_name(name),
            "folder": {},
            "@microsoft.graph.conflictBehavior": "fail",
        });
        let response = self
            .http
            .call(&CallRequest::post(url).json(&body)?.accept(StatusCode::CONFLICT))
            .await?;
        if response.status == StatusCode::CONFLICT {
            // Lost a creation race; reuse whatever won it.
            return match self.get_child(drive, parent, name, FOLDER_FIELDS).await? {
                Some(item) => folder_id_or_collision(item, name),
                None => Err(ApiError::UnexpectedStatus {
                    status: response.status,
                    body: response.snippet(),
                }),
            };
        }
        Ok(response.json::<DriveItem>()?.id)
    }

    pub async fn delete_item(&self, drive: &str, item: &str) -> Result<(), ApiError> {
        let url = self.item_url(drive, item, &[])?;
        self.http
            .call(&CallRequest::delete(url).accept(StatusCode::NOT_FOUND))
            .await?;
        Ok(())
    }

    pub async fn download_content(&self, drive: &str, item: &str) -> Result<Bytes, ApiError> {
        let url = self.item_url(drive, item, &["content"])?;
        let response = self.http.call(&CallRequest::get(url)).await?;
        Ok(response.body)
    }

    /// Ranged GET of `len` bytes starting at `start`. The server may ignore
    /// the range and answer 200 with the whole body.
    pub async fn download_range(
        &self,
        drive: &str,
        item: &str,
        start: u64,
        len: u64,
    ) -> Result<CallResponse, ApiError> {
        let url = self.item_url(drive, item, &["content"])?;
        let end = start + len.max(1) - 1;
        let range = HeaderValue::from_str(&format!("bytes={start}-{end}"))?;
        Ok(self
            .http
            .call(&CallRequest::get(url).header(RANGE, range))
            .await?)
    }

    /// Single-request upload that replaces any existing item of that name.
    pub async fn upload_small(
        &self,
        drive: &str,
        parent: &str,
        name: &str,
        content: Bytes,
    ) -> Result<CallResponse, ApiError> {
        let url = self.child_path_url(drive, parent, name, &["content"])?;
        let request = CallRequest::put(url)
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            )
            .body(content);
        Ok(self.http.call(&request).await?)
    }

    pub async fn create_upload_session(
        &self,
        drive: &str,
        parent: &str,
        name: &str,
    ) -> Result<UploadSession, ApiError> {
        let url = self.child_path_url(drive, parent, name, &["createUploadSession"])?;
        let body = json!({
            "item": { "@microsoft.graph.conflictBehavior": "replace" }
        });
        let response = self.http.call(&CallRequest::post(url).json(&body)?).await?;
        Ok(response.json::<UploadSession>()?)
    }

    /// `None` when the session no longer exists.
    pub async fn upload_session_status(
        &self,
        upload_url: &Url,
    ) -> Result<Option<UploadStatus>, ApiError> {
        let request = CallRequest::get(upload_url.clone())
            .without_auth()
            .accept(StatusCode::NOT_FOUND)
            .accept(StatusCode::GONE);
        let response = self.http.call(&request).await?;
        if is_session_gone(response.status) {
            return Ok(None);
        }
        Ok(Some(response.json::<UploadStatus>()?))
    }

    /// PUTs `[start, start + chunk.len())` of a `total`-byte upload. Session
    /// expiry (404/410) is returned as a response for the caller to handle.
    pub async fn upload_session_put(
        &self,
        upload_url: &Url,
        start: u64,
        total: u64,
        chunk: Bytes,
    ) -> Result<CallResponse, ApiError> {
        let end = start + (chunk.len() as u64).max(1) - 1;
        let content_range = HeaderValue::from_str(&format!("bytes {start}-{end}/{total}"))?;
        let request = CallRequest::put(upload_url.clone())
            .without_auth()
            .header(CONTENT_RANGE, content_range)
            .body(chunk)
            .attempts(CHUNK_PUT_ATTEMPTS)
            .accept(StatusCode::NOT_FOUND)
            .accept(StatusCode::GONE);
        Ok(self.http.call(&request).await?)
    }

    pub(crate) fn endpoint<'a, I>(&self, segments: I) -> Result<Url, ApiError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn item_url(&self, drive: &str, item: &str, tail: &[&str]) -> Result<Url, ApiError> {
        let mut segments = vec!["drives", drive];
        if item == "root" {
            segments.push("root");
        } else {
            segments.extend(["items", item]);
        }
        segments.extend_from_slice(tail);
        self.endpoint(segments)
    }

    fn child_path_url(
        &self,
        drive: &str,
        parent: &str,
        name: &str,
        tail: &[&str],
    ) -> Result<Url, ApiError> {
        let parent_segment = format!("{parent}:");
        let name_segment = format!("{}:", clean_name(name));
        let mut segments = vec!["drives", drive];
        if parent == "root" {
            segments.push("root:");
        } else {
            segments.extend(["items", parent_segment.as_str()]);
        }
        segments.push(name_segment.as_str());
        segments.extend_from_slice(tail);
        self.endpoint(segments)
    }
}

fn folder_id_or_collision(item: DriveItem, name: &str) -> Result<String, ApiError> {
    if item.is_folder() {
        Ok(item.id)
    } else {
        Err(ApiError::PathCollision {
            name: name.to_string(),
        })
    }
}

pub fn is_session_gone(status: StatusCode) -> bool {
    matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE)
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriveItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub folder: Option<FolderFacet>,
    #[serde(default)]
    pub file: Option<FileFacet>,
    #[serde(default)]
    pub hashes: Option<Hashes>,
}

impl DriveItem {
    pub fn is_folder(&self) -> bool {
        self.folder.is_some()
    }

    pub fn content_hash(&self) -> Option<&str> {
        self.file
            .as_ref()
            .and_then(|file| file.hashes.as_ref())
            .or(self.hashes.as_ref())
            .and_then(|hashes| hashes.quick_xor_hash.as_deref())
            .filter(|hash| !hash.is_empty())
    }

    pub fn to_remote_file(&self) -> RemoteFile {
        RemoteFile {
            id: self.id.clone(),
            size: self.size.unwrap_or(0),
            hash: self.content_hash().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FolderFacet {
    #[serde(rename = "childCount", default)]
    pub child_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FileFacet {
    #[serde(default)]
    pub hashes: Option<Hashes>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Hashes {
    #[serde(rename = "quickXorHash", default)]
    pub quick_xor_hash: Option<String>,
}

/// Size and content hash of a file, as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub size: u64,
    pub hash: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChildPage {
    #[serde(rename = "value", default)]
    pub items: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<Url>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadSession {
    #[serde(rename = "uploadUrl")]
    pub upload_url: Url,
    #[serde(rename = "expirationDateTime", default)]
    pub expiration: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadStatus {
    #[serde(rename = "nextExpectedRanges", default)]
    pub next_expected_ranges: Vec<String>,
}

impl UploadStatus {
    /// Start of the first range the server still expects.
    pub fn next_offset(&self) -> Option<u64> {
        let first = self.next_expected_ranges.first()?;
        first.split('-').next()?.trim().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_name_replaces_separators_and_blanks() {
        assert_eq!(clean_name("a/b"), "a_b");
        assert_eq!(clean_name("  report.pdf "), "report.pdf");
        assert_eq!(clean_name("   "), "_");
    }

    #[test]
    fn next_offset_reads_first_expected_range() {
        let status = UploadStatus {
            next_expected_ranges: vec!["1048576-".into(), "4194304-5000000".into()],
        };
        assert_eq!(status.next_offset(), Some(1_048_576));
        assert_eq!(UploadStatus::default().next_offset(), None);
        let garbage = UploadStatus {
            next_expected_ranges: vec!["oops".into()],
        };
        assert_eq!(garbage.next_offset(), None);
    }

    #[test]
    fn content_hash_prefers_file_facet_and_ignores_blanks() {
        let item: DriveItem = serde_json::from_value(json!({
            "id": "1",
            "name": "a.txt",
            "size": 3,
            "file": { "hashes": { "quickXorHash": "abc" } },
            "hashes": { "quickXorHash": "top" }
        }))
        .unwrap();
        assert_eq!(item.content_hash(), Some("abc"));

        let blank: DriveItem = serde_json::from_value(json!({
            "id": "2",
            "name": "b.txt",
            "file": { "hashes": { "quickXorHash": "" } }
        }))
        .unwrap();
        assert_eq!(blank.content_hash(), None);
        assert_eq!(blank.to_remote_file().size, 0);
    }
}
