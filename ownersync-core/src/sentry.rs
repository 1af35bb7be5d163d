use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::Config;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("ownersync/", env!("CARGO_PKG_VERSION"));

/// A failed API call, split by where in the request lifecycle it failed.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The HTTP client itself could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    Build {
        #[source]
        source: reqwest::Error,
    },

    /// The request never produced a response (connection, TLS, timeout).
    #[error("{method} {url} failed: {source}")]
    Transport {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The server answered with a non-success status code.
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: Method,
        url: String,
        status: StatusCode,
        body: String,
    },

    /// The response arrived but its body could not be decoded.
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ApiError {
    /// Status code of the response, when the server produced one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the server rejected a create because the resource already
    /// exists.
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(StatusCode::CONFLICT)
    }
}

/// Source-control platform an external identity lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Github,
    Gitlab,
}

#[derive(Debug, Error)]
#[error("unknown provider {0:?}, expected \"github\" or \"gitlab\"")]
pub struct ParseProviderError(String);

impl std::str::FromStr for Provider {
    type Err = ParseProviderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "github" => Ok(Provider::Github),
            "gitlab" => Ok(Provider::Gitlab),
            _ => Err(ParseProviderError(value.to_string())),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Github => f.write_str("github"),
            Provider::Gitlab => f.write_str("gitlab"),
        }
    }
}

/// One organization member as returned by the users endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct OrganizationMember {
    #[serde(deserialize_with = "u64_from_id")]
    pub id: u64,
    /// Absent while the member's invitation is still pending.
    #[serde(default)]
    pub user: Option<MemberAccount>,
    /// Only populated on the external-user expansion endpoint.
    #[serde(default, rename = "externalUsers")]
    pub external_users: Vec<ExternalUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberAccount {
    #[serde(default)]
    pub emails: Vec<AccountEmail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountEmail {
    pub email: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    #[serde(deserialize_with = "u64_from_id")]
    pub id: u64,
    pub slug: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Team {
    #[serde(deserialize_with = "u64_from_id")]
    pub id: u64,
    pub slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTeamRequest {
    pub provider: Provider,
    pub external_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalTeam {
    #[serde(deserialize_with = "u64_from_id")]
    pub id: u64,
    #[serde(rename = "externalName")]
    pub external_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalUserRequest {
    pub provider: Provider,
    pub external_name: String,
    pub member_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalUser {
    #[serde(deserialize_with = "u64_from_id")]
    pub id: u64,
    #[serde(rename = "externalName")]
    pub external_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CodeMapping {
    #[serde(deserialize_with = "u64_from_id")]
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeMappingRequest {
    pub project_id: u64,
    pub repository_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integration_id: Option<u64>,
    pub stack_root: String,
    pub source_root: String,
    pub default_branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeOwnersRequest {
    pub raw: String,
    pub code_mapping_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodeOwners {
    #[serde(deserialize_with = "u64_from_id")]
    pub id: u64,
}

/// Client for the Sentry REST API, scoped to one organization and one
/// project at construction time. Team-scoped calls take the team slug as an
/// explicit parameter, so a single client can serve many teams concurrently.
#[derive(Clone)]
pub struct SentryClient {
    client: Client,
    token: String,
    base_url: String,
    organization_slug: String,
    project_slug: String,
}

impl SentryClient {
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|source| ApiError::Build { source })?;

        Ok(Self {
            client,
            token: config.token.clone(),
            base_url: config.base_url.clone(),
            organization_slug: config.organization_slug.clone(),
            project_slug: config.project_slug.clone(),
        })
    }

    pub fn organization_slug(&self) -> &str {
        &self.organization_slug
    }

    pub fn project_slug(&self) -> &str {
        &self.project_slug
    }

    /// Fetch every member of the organization, with their registered emails.
    pub async fn list_organization_users(&self) -> Result<Vec<OrganizationMember>, ApiError> {
        self.get_json(&format!(
            "/api/0/organizations/{}/users/",
            self.organization_slug
        ))
        .await
    }

    /// Fetch the configured project, including its numeric id.
    pub async fn get_project(&self) -> Result<Project, ApiError> {
        self.get_json(&format!(
            "/api/0/projects/{}/{}/",
            self.organization_slug, self.project_slug
        ))
        .await
    }

    /// Resolve the configured project slug to its numeric id.
    pub async fn get_project_id(&self) -> Result<u64, ApiError> {
        Ok(self.get_project().await?.id)
    }

    /// Fetch the projects a team is a collaborator on.
    pub async fn list_team_projects(&self, team_slug: &str) -> Result<Vec<Project>, ApiError> {
        self.get_json(&format!(
            "/api/0/teams/{}/{}/projects/",
            self.organization_slug, team_slug
        ))
        .await
    }

    /// Whether the given team is a collaborator on the configured project.
    pub async fn team_has_project(&self, team_slug: &str) -> Result<bool, ApiError> {
        let projects = self.list_team_projects(team_slug).await?;
        Ok(projects
            .iter()
            .any(|project| project.slug == self.project_slug))
    }

    /// Fetch the organization's teams.
    pub async fn list_teams(&self) -> Result<Vec<Team>, ApiError> {
        self.get_json(&format!(
            "/api/0/organizations/{}/teams/",
            self.organization_slug
        ))
        .await
    }

    /// Associate an external team name with a Sentry team.
    pub async fn create_external_team(
        &self,
        team_slug: &str,
        request: &ExternalTeamRequest,
    ) -> Result<ExternalTeam, ApiError> {
        info!(
            "Linking external team {} to {}",
            request.external_name, team_slug
        );
        self.post_json(
            &format!(
                "/api/0/teams/{}/{}/externalteam/",
                self.organization_slug, team_slug
            ),
            request,
        )
        .await
    }

    /// Update an existing external-team association.
    pub async fn update_external_team(
        &self,
        team_slug: &str,
        external_team_id: u64,
        request: &ExternalTeamRequest,
    ) -> Result<ExternalTeam, ApiError> {
        info!(
            "Updating external team {} on {}",
            external_team_id, team_slug
        );
        self.put_json(
            &format!(
                "/api/0/teams/{}/{}/externalteam/{}/",
                self.organization_slug, team_slug, external_team_id
            ),
            request,
        )
        .await
    }

    /// Fetch organization members together with their external-user
    /// associations.
    pub async fn list_members_with_external_users(
        &self,
    ) -> Result<Vec<OrganizationMember>, ApiError> {
        self.get_json(&format!(
            "/api/0/organizations/{}/members/?expand=externalUsers",
            self.organization_slug
        ))
        .await
    }

    /// Associate an external username with an organization member.
    pub async fn create_external_user(
        &self,
        request: &ExternalUserRequest,
    ) -> Result<ExternalUser, ApiError> {
        info!(
            "Linking external user {} to member {}",
            request.external_name, request.member_id
        );
        self.post_json(
            &format!(
                "/api/0/organizations/{}/members/externaluser/",
                self.organization_slug
            ),
            request,
        )
        .await
    }

    /// Fetch the code mappings configured for a project.
    pub async fn list_code_mappings(&self, project_id: u64) -> Result<Vec<CodeMapping>, ApiError> {
        self.get_json(&format!(
            "/api/0/organizations/{}/code-mappings/?projectId={}",
            self.organization_slug, project_id
        ))
        .await
    }

    /// Create a code mapping between a project and a repository path.
    pub async fn create_code_mapping(
        &self,
        request: &CodeMappingRequest,
    ) -> Result<CodeMapping, ApiError> {
        info!(
            "Creating code mapping for project {} on repository {}",
            request.project_id, request.repository_id
        );
        self.post_json(
            &format!(
                "/api/0/organizations/{}/code-mappings/",
                self.organization_slug
            ),
            request,
        )
        .await
    }

    /// Upload CODEOWNERS content for the configured project.
    pub async fn create_codeowners(
        &self,
        request: &CodeOwnersRequest,
    ) -> Result<CodeOwners, ApiError> {
        info!(
            "Uploading CODEOWNERS ({} bytes) with code mapping {}",
            request.raw.len(),
            request.code_mapping_id
        );
        let created: CodeOwners = self
            .post_json(
                &format!(
                    "/api/0/projects/{}/{}/codeowners/",
                    self.organization_slug, self.project_slug
                ),
                request,
            )
            .await?;
        info!("Successfully created CODEOWNERS with ID: {}", created.id);
        Ok(created)
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = self.api_url(path);
        let request = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token));
        read_json(Method::GET, url, request).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.api_url(path);
        let request = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(body);
        read_json(Method::POST, url, request).await
    }

    async fn put_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.api_url(path);
        let request = self
            .client
            .put(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(body);
        read_json(Method::PUT, url, request).await
    }
}

async fn read_json<T: DeserializeOwned>(
    method: Method,
    url: String,
    request: RequestBuilder,
) -> Result<T, ApiError> {
    debug!("{} {}", method, url);

    let response = request.send().await.map_err(|source| ApiError::Transport {
        method: method.clone(),
        url: url.clone(),
        source,
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        error!("Sentry API error: {} {} - {} - {}", method, url, status, body);
        return Err(ApiError::Status {
            method,
            url,
            status,
            body,
        });
    }

    response
        .json()
        .await
        .map_err(|source| ApiError::Decode { url, source })
}

/// Sentry serializes record ids as JSON strings; accept both that and plain
/// integers.
fn u64_from_id<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct IdVisitor;

    impl Visitor<'_> for IdVisitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an integer id or a string containing one")
        }

        fn visit_u64<E>(self, value: u64) -> Result<u64, E> {
            Ok(value)
        }

        fn visit_i64<E>(self, value: i64) -> Result<u64, E>
        where
            E: de::Error,
        {
            u64::try_from(value).map_err(|_| E::custom(format!("negative id: {value}")))
        }

        fn visit_str<E>(self, value: &str) -> Result<u64, E>
        where
            E: de::Error,
        {
            value
                .parse()
                .map_err(|_| E::custom(format!("invalid id: {value:?}")))
        }
    }

    deserializer.deserialize_any(IdVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_client() -> SentryClient {
        let config = Config {
            token: "test-token".to_string(),
            base_url: "https://sentry.example.com".to_string(),
            organization_slug: "acme".to_string(),
            project_slug: "backend".to_string(),
            provider: Provider::Github,
        };
        SentryClient::new(&config).unwrap()
    }

    #[test]
    fn test_api_url_joins_base_and_path() {
        let client = test_client();
        assert_eq!(
            client.api_url("/api/0/organizations/acme/users/"),
            "https://sentry.example.com/api/0/organizations/acme/users/"
        );
    }

    #[test]
    fn test_member_decodes_string_and_numeric_ids() {
        let members: Vec<OrganizationMember> = serde_json::from_value(json!([
            {"id": "57377908164", "user": {"emails": [{"email": "a@x.com"}]}},
            {"id": 42, "user": {"emails": []}},
        ]))
        .unwrap();

        assert_eq!(members[0].id, 57377908164);
        assert_eq!(members[0].user.as_ref().unwrap().emails[0].email, "a@x.com");
        assert_eq!(members[1].id, 42);
    }

    #[test]
    fn test_member_without_user_account_decodes() {
        // Pending invitations have no user object yet
        let member: OrganizationMember =
            serde_json::from_value(json!({"id": "9", "email": "invited@x.com"})).unwrap();

        assert_eq!(member.id, 9);
        assert!(member.user.is_none());
        assert!(member.external_users.is_empty());
    }

    #[test]
    fn test_member_with_external_users_decodes() {
        let member: OrganizationMember = serde_json::from_value(json!({
            "id": "12",
            "user": {"emails": [{"email": "a@x.com"}]},
            "externalUsers": [{"id": "3", "externalName": "a-gh", "provider": "github"}],
        }))
        .unwrap();

        assert_eq!(member.external_users.len(), 1);
        assert_eq!(member.external_users[0].external_name, "a-gh");
    }

    #[test]
    fn test_negative_id_is_rejected() {
        let result: Result<Project, _> =
            serde_json::from_value(json!({"id": -1, "slug": "backend"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_external_team_request_wire_format() {
        let request = ExternalTeamRequest {
            provider: Provider::Github,
            external_name: "acme-org/backend".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"provider": "github", "externalName": "acme-org/backend"})
        );
    }

    #[test]
    fn test_external_user_request_wire_format() {
        let request = ExternalUserRequest {
            provider: Provider::Gitlab,
            external_name: "a-gl".to_string(),
            member_id: 57377908164,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"provider": "gitlab", "externalName": "a-gl", "memberId": 57377908164u64})
        );
    }

    #[test]
    fn test_codeowners_request_wire_format() {
        let request = CodeOwnersRequest {
            raw: "* @acme-org/backend\n".to_string(),
            code_mapping_id: 7,
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"raw": "* @acme-org/backend\n", "codeMappingId": 7})
        );
    }

    #[test]
    fn test_code_mapping_request_omits_absent_integration() {
        let request = CodeMappingRequest {
            project_id: 42,
            repository_id: 5,
            integration_id: None,
            stack_root: "src/".to_string(),
            source_root: "backend/src/".to_string(),
            default_branch: "main".to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("integrationId").is_none());
        assert_eq!(value["projectId"], 42);
        assert_eq!(value["defaultBranch"], "main");
    }

    #[test]
    fn test_provider_parse_and_display() {
        assert_eq!("github".parse::<Provider>().unwrap(), Provider::Github);
        assert_eq!("GITLAB".parse::<Provider>().unwrap(), Provider::Gitlab);
        assert!("svn".parse::<Provider>().is_err());
        assert_eq!(Provider::Github.to_string(), "github");
        assert_eq!(Provider::Gitlab.to_string(), "gitlab");
    }

    #[test]
    fn test_conflict_detection() {
        let conflict = ApiError::Status {
            method: Method::POST,
            url: "https://sentry.example.com/api/0/x".to_string(),
            status: StatusCode::CONFLICT,
            body: "already exists".to_string(),
        };
        assert!(conflict.is_conflict());

        let server_error = ApiError::Status {
            method: Method::POST,
            url: "https://sentry.example.com/api/0/x".to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: String::new(),
        };
        assert!(!server_error.is_conflict());
        assert_eq!(
            server_error.status(),
            Some(StatusCode::INTERNAL_SERVER_ERROR)
        );
    }
}
