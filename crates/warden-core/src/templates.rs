//! Built-in connection templates.
//!
//! Caller `connections` that name no entry in the config's connector pool
//! fall back to these. Each template expects its credential in the caller
//! env or process environment and scopes requests to the service's API host.

use std::collections::{BTreeMap, HashMap};

use crate::config::RouteConfig;

fn template(
    name: &str,
    description: &str,
    docs_url: &str,
    headers: &[(&str, &str)],
    secrets: &[(&str, &str)],
    allowed_endpoints: &[&str],
) -> RouteConfig {
    RouteConfig {
        name: Some(name.to_string()),
        description: Some(description.to_string()),
        docs_url: Some(docs_url.to_string()),
        openapi_url: None,
        headers: headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        secrets: secrets
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        allowed_endpoints: allowed_endpoints.iter().map(|s| s.to_string()).collect(),
        resolve_secrets_in_body: false,
        ingestor: None,
    }
}

/// The compiled-in template set, keyed by connection alias.
#[must_use]
pub fn builtin_templates() -> BTreeMap<String, RouteConfig> {
    let mut templates = BTreeMap::new();

    templates.insert(
        "github".to_string(),
        template(
            "GitHub",
            "GitHub REST API v3",
            "https://docs.github.com/en/rest",
            &[
                ("Authorization", "Bearer ${GITHUB_TOKEN}"),
                ("Accept", "application/vnd.github+json"),
                ("X-GitHub-Api-Version", "2022-11-28"),
            ],
            &[("GITHUB_TOKEN", "${GITHUB_TOKEN}")],
            &["https://api.github.com/**"],
        ),
    );

    templates.insert(
        "stripe".to_string(),
        template(
            "Stripe",
            "Stripe payments API",
            "https://docs.stripe.com/api",
            &[("Authorization", "Bearer ${STRIPE_SECRET_KEY}")],
            &[("STRIPE_SECRET_KEY", "${STRIPE_SECRET_KEY}")],
            &["https://api.stripe.com/v1/**"],
        ),
    );

    templates.insert(
        "slack".to_string(),
        template(
            "Slack",
            "Slack Web API",
            "https://api.slack.com/web",
            &[("Authorization", "Bearer ${SLACK_BOT_TOKEN}")],
            &[("SLACK_BOT_TOKEN", "${SLACK_BOT_TOKEN}")],
            &["https://slack.com/api/**"],
        ),
    );

    templates.insert(
        "notion".to_string(),
        template(
            "Notion",
            "Notion REST API",
            "https://developers.notion.com/reference",
            &[
                ("Authorization", "Bearer ${NOTION_TOKEN}"),
                ("Notion-Version", "2022-06-28"),
            ],
            &[("NOTION_TOKEN", "${NOTION_TOKEN}")],
            &["https://api.notion.com/v1/**"],
        ),
    );

    templates.insert(
        "discord".to_string(),
        template(
            "Discord",
            "Discord REST API",
            "https://discord.com/developers/docs/reference",
            &[("Authorization", "Bot ${DISCORD_BOT_TOKEN}")],
            &[("DISCORD_BOT_TOKEN", "${DISCORD_BOT_TOKEN}")],
            &["https://discord.com/api/**"],
        ),
    );

    templates
}
