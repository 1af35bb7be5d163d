//! Reconciliation engine: pushes the local team map, user map and CODEOWNERS
//! file into Sentry in four ordered phases.
//!
//! Every phase validates before it writes. A missing team, unresolvable email
//! or absent code mapping aborts the run before any dependent write is
//! dispatched, and the error carries the complete list of offending keys so
//! one run surfaces every problem it found. Writes already issued by an
//! earlier phase are not rolled back.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::mappings::{TeamMap, UserMap};
use crate::sentry::{
    ApiError, CodeMapping, CodeOwners, CodeOwnersRequest, ExternalTeam, ExternalTeamRequest,
    ExternalUser, ExternalUserRequest, OrganizationMember, Project, Provider, SentryClient,
};

/// The subset of the Sentry API the reconciliation engine needs.
///
/// The engine is generic over this so tests can drive it against an
/// in-memory fake instead of a live server.
#[async_trait]
pub trait OwnershipApi: Send + Sync {
    /// Slug of the project this sync targets.
    fn project_slug(&self) -> &str;

    async fn team_has_project(&self, team_slug: &str) -> Result<bool, ApiError>;

    async fn create_external_team(
        &self,
        team_slug: &str,
        request: &ExternalTeamRequest,
    ) -> Result<ExternalTeam, ApiError>;

    async fn list_organization_users(&self) -> Result<Vec<OrganizationMember>, ApiError>;

    async fn create_external_user(
        &self,
        request: &ExternalUserRequest,
    ) -> Result<ExternalUser, ApiError>;

    async fn get_project(&self) -> Result<Project, ApiError>;

    async fn list_code_mappings(&self, project_id: u64) -> Result<Vec<CodeMapping>, ApiError>;

    async fn create_codeowners(&self, request: &CodeOwnersRequest) -> Result<CodeOwners, ApiError>;
}

#[async_trait]
impl OwnershipApi for SentryClient {
    fn project_slug(&self) -> &str {
        SentryClient::project_slug(self)
    }

    async fn team_has_project(&self, team_slug: &str) -> Result<bool, ApiError> {
        SentryClient::team_has_project(self, team_slug).await
    }

    async fn create_external_team(
        &self,
        team_slug: &str,
        request: &ExternalTeamRequest,
    ) -> Result<ExternalTeam, ApiError> {
        SentryClient::create_external_team(self, team_slug, request).await
    }

    async fn list_organization_users(&self) -> Result<Vec<OrganizationMember>, ApiError> {
        SentryClient::list_organization_users(self).await
    }

    async fn create_external_user(
        &self,
        request: &ExternalUserRequest,
    ) -> Result<ExternalUser, ApiError> {
        SentryClient::create_external_user(self, request).await
    }

    async fn get_project(&self) -> Result<Project, ApiError> {
        SentryClient::get_project(self).await
    }

    async fn list_code_mappings(&self, project_id: u64) -> Result<Vec<CodeMapping>, ApiError> {
        SentryClient::list_code_mappings(self, project_id).await
    }

    async fn create_codeowners(&self, request: &CodeOwnersRequest) -> Result<CodeOwners, ApiError> {
        SentryClient::create_codeowners(self, request).await
    }
}

/// All errors that can abort a sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An API call failed outright.
    #[error("api request failed: {0}")]
    Api(#[from] ApiError),

    /// Teams named in the team map that are not collaborators on the project.
    #[error(
        "the following teams are not associated with the project {project:?}: {}",
        join_keys(.teams)
    )]
    MissingTeams { project: String, teams: Vec<String> },

    /// Emails named in the user map that match no organization member.
    #[error("the following users do not have a Sentry account: {}", join_keys(.emails))]
    MissingUsers { emails: Vec<String> },

    /// CODEOWNERS content cannot be attributed without a code mapping.
    #[error(
        "project {project:?} (id {project_id}) has no code mapping; create one before uploading CODEOWNERS"
    )]
    NoCodeMapping { project: String, project_id: u64 },

    /// Associations that could not be created, as "key: reason" entries.
    #[error("{} association(s) could not be created: {}", .failures.len(), join_keys(.failures))]
    AssociationFailed { failures: Vec<String> },
}

fn join_keys(keys: &[String]) -> String {
    keys.join(", ")
}

/// Counters describing what a run did, for the final summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub teams_checked: usize,
    pub team_links_created: usize,
    pub team_links_existing: usize,
    pub members_fetched: usize,
    pub user_links_created: usize,
    pub user_links_existing: usize,
    pub code_mapping_id: Option<u64>,
    pub codeowners_uploaded: bool,
}

/// Run the full four-phase sync: team links, user links, code-mapping
/// resolution, CODEOWNERS upload.
pub async fn run<A: OwnershipApi>(
    api: &A,
    provider: Provider,
    team_map: &TeamMap,
    user_map: &UserMap,
    codeowners: &str,
    dry_run: bool,
) -> Result<SyncReport, SyncError> {
    let mut report = SyncReport::default();

    link_teams(api, provider, team_map, dry_run, &mut report).await?;
    link_users(api, provider, user_map, dry_run, &mut report).await?;
    let mapping = resolve_code_mapping(api, &mut report).await?;
    upload_codeowners(api, codeowners, &mapping, dry_run, &mut report).await?;

    Ok(report)
}

async fn link_teams<A: OwnershipApi>(
    api: &A,
    provider: Provider,
    team_map: &TeamMap,
    dry_run: bool,
    report: &mut SyncReport,
) -> Result<(), SyncError> {
    if team_map.is_empty() {
        info!("Team map is empty, skipping team reconciliation");
        return Ok(());
    }

    info!(
        "Checking {} team(s) against project {}",
        team_map.len(),
        api.project_slug()
    );

    let checks = join_all(team_map.iter().map(|(team_slug, _)| async move {
        let present = api.team_has_project(team_slug).await?;
        Ok::<_, ApiError>((team_slug, present))
    }))
    .await;

    let mut missing = Vec::new();
    for check in checks {
        let (team_slug, present) = check?;
        report.teams_checked += 1;
        if !present {
            warn!(
                "Team {} is not associated with project {}",
                team_slug,
                api.project_slug()
            );
            missing.push(team_slug.clone());
        }
    }
    if !missing.is_empty() {
        return Err(SyncError::MissingTeams {
            project: api.project_slug().to_string(),
            teams: missing,
        });
    }

    let links: Vec<(&String, &String)> = team_map
        .iter()
        .flat_map(|(team_slug, identities)| {
            identities.iter().map(move |identity| (team_slug, identity))
        })
        .collect();

    if dry_run {
        for (team_slug, identity) in &links {
            info!(
                "Dry run: would link external team {} to {}",
                identity, team_slug
            );
        }
        return Ok(());
    }

    let outcomes = join_all(links.iter().map(|&(team_slug, identity)| {
        let request = ExternalTeamRequest {
            provider,
            external_name: identity.clone(),
        };
        async move {
            link_outcome(
                format!("{}/{}", team_slug, identity),
                api.create_external_team(team_slug, &request).await,
            )
        }
    }))
    .await;

    let (created, existing, failures) = fold_outcomes(outcomes);
    report.team_links_created = created;
    report.team_links_existing = existing;
    if !failures.is_empty() {
        return Err(SyncError::AssociationFailed { failures });
    }

    info!(
        "Linked {} external team(s) ({} already present)",
        created, existing
    );
    Ok(())
}

async fn link_users<A: OwnershipApi>(
    api: &A,
    provider: Provider,
    user_map: &UserMap,
    dry_run: bool,
    report: &mut SyncReport,
) -> Result<(), SyncError> {
    if user_map.is_empty() {
        info!("User map is empty, skipping user reconciliation");
        return Ok(());
    }

    let members = api.list_organization_users().await?;
    report.members_fetched = members.len();
    let member_ids = member_ids_by_email(&members);
    info!(
        "Resolved {} email(s) across {} organization member(s)",
        member_ids.len(),
        members.len()
    );

    let mut missing = Vec::new();
    let mut links: Vec<(&String, u64, &String)> = Vec::new();
    for (email, identities) in user_map.iter() {
        match member_ids.get(email.as_str()) {
            Some(&member_id) => {
                for identity in identities {
                    links.push((email, member_id, identity));
                }
            }
            None => {
                warn!("No organization member has email {}", email);
                missing.push(email.clone());
            }
        }
    }
    if !missing.is_empty() {
        return Err(SyncError::MissingUsers { emails: missing });
    }

    if dry_run {
        for (email, member_id, identity) in &links {
            info!(
                "Dry run: would link external user {} to member {} ({})",
                identity, member_id, email
            );
        }
        return Ok(());
    }

    let outcomes = join_all(links.iter().map(|&(email, member_id, identity)| {
        let request = ExternalUserRequest {
            provider,
            external_name: identity.clone(),
            member_id,
        };
        async move {
            link_outcome(
                format!("{}/{}", email, identity),
                api.create_external_user(&request).await,
            )
        }
    }))
    .await;

    let (created, existing, failures) = fold_outcomes(outcomes);
    report.user_links_created = created;
    report.user_links_existing = existing;
    if !failures.is_empty() {
        return Err(SyncError::AssociationFailed { failures });
    }

    info!(
        "Linked {} external user(s) ({} already present)",
        created, existing
    );
    Ok(())
}

async fn resolve_code_mapping<A: OwnershipApi>(
    api: &A,
    report: &mut SyncReport,
) -> Result<CodeMapping, SyncError> {
    let project = api.get_project().await?;
    let mappings = api.list_code_mappings(project.id).await?;
    let count = mappings.len();

    match mappings.into_iter().next() {
        Some(mapping) => {
            if count > 1 {
                info!(
                    "Project {} has {} code mappings, using the first",
                    project.slug, count
                );
            }
            info!(
                "Using code mapping {} for project {} (id {})",
                mapping.id, project.slug, project.id
            );
            report.code_mapping_id = Some(mapping.id);
            Ok(mapping)
        }
        None => Err(SyncError::NoCodeMapping {
            project: project.slug,
            project_id: project.id,
        }),
    }
}

async fn upload_codeowners<A: OwnershipApi>(
    api: &A,
    codeowners: &str,
    mapping: &CodeMapping,
    dry_run: bool,
    report: &mut SyncReport,
) -> Result<(), SyncError> {
    if dry_run {
        info!(
            "Dry run: would upload CODEOWNERS ({} bytes) with code mapping {}",
            codeowners.len(),
            mapping.id
        );
        return Ok(());
    }

    let request = CodeOwnersRequest {
        raw: codeowners.to_string(),
        code_mapping_id: mapping.id,
    };
    match api.create_codeowners(&request).await {
        Ok(_) => {
            report.codeowners_uploaded = true;
            Ok(())
        }
        Err(error) if error.is_conflict() => {
            warn!(
                "CODEOWNERS already uploaded for code mapping {}, leaving it unchanged",
                mapping.id
            );
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}

/// Index members by every email registered on their account. The first
/// member holding an email keeps it; later duplicates do not overwrite.
pub fn member_ids_by_email(members: &[OrganizationMember]) -> HashMap<&str, u64> {
    let mut index = HashMap::new();
    for member in members {
        // Pending invitations have no account and no resolvable emails
        if let Some(account) = &member.user {
            for address in &account.emails {
                index.entry(address.email.as_str()).or_insert(member.id);
            }
        }
    }
    index
}

enum LinkOutcome {
    Created,
    Existing,
    Failed(String),
}

fn link_outcome<T>(key: String, result: Result<T, ApiError>) -> LinkOutcome {
    match result {
        Ok(_) => LinkOutcome::Created,
        Err(error) if error.is_conflict() => {
            info!("{} is already linked", key);
            LinkOutcome::Existing
        }
        Err(error) => {
            warn!("Failed to link {}: {}", key, error);
            LinkOutcome::Failed(format!("{}: {}", key, error))
        }
    }
}

fn fold_outcomes(outcomes: Vec<LinkOutcome>) -> (usize, usize, Vec<String>) {
    let mut created = 0;
    let mut existing = 0;
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            LinkOutcome::Created => created += 1,
            LinkOutcome::Existing => existing += 1,
            LinkOutcome::Failed(failure) => failures.push(failure),
        }
    }
    (created, existing, failures)
}
