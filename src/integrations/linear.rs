use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Value, json};

const LINEAR_API_URL: &str = "https://api.linear.app/graphql";

/// An issue to create in the tracker.
#[derive(Debug, Clone, Default)]
pub struct NewIssue {
    pub title: String,
    pub description: String,
    /// Team name or key.
    pub team: String,
}

/// Title and description of an existing tracker issue.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueDetails {
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct Nodes<T> {
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Team {
    id: String,
    name: String,
    key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeamsData {
    teams: Nodes<Team>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueCreateData {
    issue_create: IssueCreatePayload,
}

#[derive(Debug, Deserialize)]
struct IssueCreatePayload {
    #[serde(default)]
    issue: Option<CreatedIssue>,
}

#[derive(Debug, Deserialize)]
struct CreatedIssue {
    identifier: String,
}

#[derive(Debug, Deserialize)]
struct IssuesData<T> {
    issues: Nodes<T>,
}

#[derive(Debug, Deserialize)]
struct IssueRef {
    identifier: String,
}

/// Linear GraphQL client. Unconfigured when no API key is present.
#[derive(Debug, Clone)]
pub struct LinearClient {
    api_key: Option<String>,
    endpoint: String,
    http: reqwest::Client,
}

impl LinearClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: super::non_empty(api_key),
            endpoint: LINEAR_API_URL.to_string(),
            http: super::http_client(),
        }
    }

    /// Point the client at another GraphQL endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Create an issue and return its identifier (e.g. `ENG-42`).
    pub async fn create_issue(&self, issue: &NewIssue) -> Result<String> {
        let team_id = self
            .resolve_team_id(&issue.team)
            .await
            .context("resolve team")?;

        let query = "mutation CreateIssue($input: IssueCreateInput!) {
            issueCreate(input: $input) { success issue { id identifier } }
        }";
        let input = json!({
            "title": issue.title,
            "description": issue.description,
            "teamId": team_id,
        });
        let data: IssueCreateData = self.graphql(query, json!({ "input": input })).await?;
        data.issue_create
            .issue
            .map(|i| i.identifier)
            .context("linear returned no issue")
    }

    /// Fetch an issue by identifier such as `ENG-42`.
    pub async fn get_issue(&self, identifier: &str) -> Result<IssueDetails> {
        let (team_key, number) = split_identifier(identifier)?;
        let query = "query GetIssue($filter: IssueFilter) {
            issues(filter: $filter, first: 1) { nodes { identifier title description } }
        }";
        let filter = json!({
            "number": { "eq": number },
            "team": { "key": { "eq": team_key } },
        });
        let data: IssuesData<IssueDetails> =
            self.graphql(query, json!({ "filter": filter })).await?;
        data.issues
            .nodes
            .into_iter()
            .next()
            .with_context(|| format!("issue not found: {}", identifier))
    }

    /// Identifier of the first issue whose title matches exactly.
    pub async fn search_issue_by_title(&self, title: &str) -> Result<Option<String>> {
        let query = "query SearchIssues($filter: IssueFilter) {
            issues(filter: $filter, first: 1) { nodes { id identifier title } }
        }";
        let filter = json!({ "title": { "eq": title } });
        let data: IssuesData<IssueRef> = self.graphql(query, json!({ "filter": filter })).await?;
        Ok(data.issues.nodes.into_iter().next().map(|i| i.identifier))
    }

    /// Record that `blocking` blocks `blocked`.
    pub async fn create_relation(&self, blocking: &str, blocked: &str) -> Result<()> {
        let query = "mutation CreateRelation($input: IssueRelationCreateInput!) {
            issueRelationCreate(input: $input) { success }
        }";
        let input = json!({
            "issueId": blocking,
            "relatedIssueId": blocked,
            "type": "blocks",
        });
        let _: Value = self.graphql(query, json!({ "input": input })).await?;
        Ok(())
    }

    async fn resolve_team_id(&self, team: &str) -> Result<String> {
        let query = "query Teams { teams { nodes { id name key } } }";
        let data: TeamsData = self.graphql(query, Value::Null).await?;
        data.teams
            .nodes
            .into_iter()
            .find(|t| t.name == team || t.key == team)
            .map(|t| t.id)
            .with_context(|| format!("team not found: {}", team))
    }

    async fn graphql<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T> {
        let Some(key) = &self.api_key else {
            anyhow::bail!("LINEAR_API_KEY not set");
        };

        let mut body = json!({ "query": query });
        if !variables.is_null() {
            body["variables"] = variables;
        }

        let resp = self
            .http
            .post(&self.endpoint)
            .header("Authorization", key)
            .json(&body)
            .send()
            .await
            .context("linear request")?;

        let status = resp.status();
        let text = resp.text().await.context("read linear response")?;
        if !status.is_success() {
            anyhow::bail!("linear HTTP {}: {}", status.as_u16(), text);
        }

        let parsed: GraphQlResponse<T> =
            serde_json::from_str(&text).context("parse linear response")?;
        if let Some(err) = parsed.errors.first() {
            anyhow::bail!("linear error: {}", err.message);
        }
        parsed.data.context("linear response has no data")
    }
}

/// Split `TEAM-123` into its team key and number.
fn split_identifier(identifier: &str) -> Result<(&str, i64)> {
    let (team, number) = identifier
        .split_once('-')
        .with_context(|| format!("invalid identifier format: {}", identifier))?;
    let number = number
        .parse()
        .with_context(|| format!("invalid issue number in identifier {}", identifier))?;
    Ok((team, number))
}
