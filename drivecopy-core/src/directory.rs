//! Read-only lookups used to pick source and destination containers.

use reqwest::StatusCode;
use reqwest::header::{HeaderName, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::client::{ApiError, DriveClient};
use crate::http::CallRequest;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Site {
    pub id: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(rename = "webUrl", default)]
    pub web_url: Option<String>,
}

impl Site {
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.web_url.as_deref())
            .unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Drive {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "driveType", default)]
    pub drive_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    #[serde(rename = "userPrincipalName", default)]
    pub user_principal_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<Url>,
}

#[derive(Clone)]
pub struct DirectoryClient {
    drive: DriveClient,
}

impl DirectoryClient {
    pub fn new(drive: DriveClient) -> Self {
        Self { drive }
    }

    /// Resolves `https://host/sites/Name` to its site record.
    pub async fn resolve_site_by_url(&self, site_url: &str) -> Result<Site, ApiError> {
        let parsed = Url::parse(site_url)?;
        let host = parsed
            .host_str()
            .ok_or(url::ParseError::EmptyHost)?
            .to_string();
        let host_segment = format!("{host}:");
        let mut segments = vec!["sites", host_segment.as_str()];
        segments.extend(parsed.path().split('/').filter(|part| !part.is_empty()));
        let url = self.drive.endpoint(segments)?;
        let response = self.drive.http().call(&CallRequest::get(url)).await?;
        Ok(response.json::<Site>()?)
    }

    pub async fn search_sites(&self, query: &str) -> Result<Vec<Site>, ApiError> {
        let mut url = self.drive.endpoint(["sites"])?;
        url.query_pairs_mut()
            .append_pair("search", query)
            .append_pair("$select", "id,displayName,webUrl");
        self.collect_pages(url).await
    }

    /// Document libraries of a site; other drive types are filtered out.
    pub async fn list_site_libraries(&self, site_id: &str) -> Result<Vec<Drive>, ApiError> {
        let mut url = self.drive.endpoint(["sites", site_id, "drives"])?;
        url.query_pairs_mut()
            .append_pair("$select", "id,name,driveType");
        let drives: Vec<Drive> = self.collect_pages(url).await?;
        Ok(drives
            .into_iter()
            .filter(|drive| drive.drive_type.as_deref() == Some("documentLibrary"))
            .collect())
    }

    pub async fn search_users(&self, query: &str, top: u32) -> Result<Vec<User>, ApiError> {
        let query = query.trim().replace('\'', "''");
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let filter =
            format!("startswith(displayName,'{query}') or startswith(userPrincipalName,'{query}')");
        let mut url = self.drive.endpoint(["users"])?;
        url.query_pairs_mut()
            .append_pair("$select", "id,displayName,userPrincipalName")
            .append_pair("$filter", &filter)
            .append_pair("$orderby", "displayName")
            .append_pair("$top", &top.to_string())
            .append_pair("$count", "true");
        let request = CallRequest::get(url).header(
            HeaderName::from_static("consistencylevel"),
            HeaderValue::from_static("eventual"),
        );
        let response = self.drive.http().call(&request).await?;
        Ok(response.json::<Page<User>>()?.value)
    }

    /// The user's personal drive, or `None` when the user has none.
    pub async fn resolve_user_drive(&self, user: &str) -> Result<Option<Drive>, ApiError> {
        let url = self.drive.endpoint(["users", user, "drive"])?;
        let response = self
            .drive
            .http()
            .call(&CallRequest::get(url).accept(StatusCode::NOT_FOUND))
            .await?;
        if response.status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.json::<Drive>()?))
    }

    async fn collect_pages<T: DeserializeOwned>(&self, first: Url) -> Result<Vec<T>, ApiError> {
        let mut next = Some(first);
        let mut out = Vec::new();
        while let Some(url) = next {
            let response = self.drive.http().call(&CallRequest::get(url)).await?;
            let page = response.json::<Page<T>>()?;
            out.extend(page.value);
            next = page.next_link;
        }
        Ok(out)
    }
}
