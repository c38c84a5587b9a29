//! Built-in native tasks
//!
//! `link_follower` crawls one site breadth-first from `options.url`, storing
//! each page title and following same-host links until `max_depth`.

use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

use crate::collect::{
    CrawlError, CrawlerContext, Fetcher, ParseResult, RequestSeed, Rule, RuleTree, Storager, Task,
    TaskOptions,
};
use crate::utils::{extract_domain, normalize_whitespace, resolve_url};

/// Rule applied to every page of a link-following task
pub const PAGE_RULE: &str = "page";

fn title_re() -> &'static Regex {
    static TITLE_RE: OnceLock<Regex> = OnceLock::new();
    TITLE_RE.get_or_init(|| {
        Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("Invalid regex pattern")
    })
}

fn href_re() -> &'static Regex {
    static HREF_RE: OnceLock<Regex> = OnceLock::new();
    HREF_RE.get_or_init(|| {
        Regex::new(r#"(?i)<a\s[^>]*?href\s*=\s*["']([^"']+)["']"#).expect("Invalid regex pattern")
    })
}

/// Page title, whitespace-normalized
pub fn extract_title(body: &str) -> Option<String> {
    title_re()
        .captures(body)
        .map(|c| normalize_whitespace(&c[1]))
        .filter(|t| !t.is_empty())
}

/// Absolute links on the page that stay on `host`, in document order
pub fn same_host_links(base: &str, body: &str, host: &str) -> Vec<String> {
    let mut links: Vec<String> = Vec::new();
    for cap in href_re().captures_iter(body) {
        let Some(url) = resolve_url(base, &cap[1]) else {
            continue;
        };
        if extract_domain(&url).as_deref() != Some(host) {
            continue;
        }
        if !links.contains(&url) {
            links.push(url);
        }
    }
    links
}

fn parse_page(ctx: &CrawlerContext<'_>) -> Result<ParseResult, CrawlError> {
    let url = &ctx.request.url;
    let host = extract_domain(url).ok_or_else(|| CrawlError::Rule(format!("no host in {url}")))?;

    let title = extract_title(ctx.body).unwrap_or_default();
    let mut result = ParseResult::new().with_item(
        ctx.cell()
            .with("title", Value::String(title))
            .with("depth", Value::from(ctx.request.depth)),
    );

    for link in same_host_links(url, ctx.body, &host) {
        result = result.with_request(ctx.follow(link, PAGE_RULE));
    }
    Ok(result)
}

/// Rule tree seeding `entry` and following links with [`PAGE_RULE`]
pub fn link_follower_rules(entry: impl Into<String>) -> RuleTree {
    let entry = entry.into();
    RuleTree::native_root(move || {
        if entry.is_empty() {
            return Err(CrawlError::Rule("link follower needs an entry url".into()));
        }
        Ok(vec![RequestSeed::new(entry.clone(), PAGE_RULE).with_priority(1)])
    })
    .with_rule(PAGE_RULE, Rule::native(parse_page))
}

/// Task crawling the site at `options.url`
pub fn link_follower(
    options: TaskOptions,
    fetcher: Arc<dyn Fetcher>,
    storage: Arc<dyn Storager>,
) -> Task {
    let rules = link_follower_rules(options.url.clone());
    Task::new(options, rules, fetcher, storage)
}
