//! The `JOB_ID` / `PORT` / `NODE` / `URL` lines handed from the submitter to
//! the launcher.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Where a running notebook server can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub job_id: u64,
    pub port: u16,
    pub node: String,
    pub url: String,
}

impl fmt::Display for ConnectionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "JOB_ID: {}", self.job_id)?;
        writeln!(f, "PORT: {}", self.port)?;
        writeln!(f, "NODE: {}", self.node)?;
        writeln!(f, "URL: {}", self.url)
    }
}

/// Labeled values found in remote output. Any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteReport {
    pub job_id: Option<u64>,
    pub port: Option<u16>,
    pub node: Option<String>,
    pub url: Option<String>,
}

fn line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(JOB_ID|PORT|NODE|URL):\s*(.*?)\s*$").expect("summary line pattern is valid")
    })
}

impl RemoteReport {
    /// Pick the labeled lines out of arbitrary output (ssh banners, warnings
    /// and log lines may be mixed in). The last occurrence of a label wins.
    pub fn parse(output: &str) -> Self {
        let mut report = RemoteReport::default();
        for caps in output.lines().filter_map(|line| line_regex().captures(line)) {
            let value = &caps[2];
            match &caps[1] {
                "JOB_ID" => report.job_id = value.parse().ok(),
                "PORT" => report.port = value.parse().ok(),
                "NODE" => report.node = Some(value.to_string()).filter(|v| !v.is_empty()),
                "URL" => report.url = Some(value.to_string()).filter(|v| !v.is_empty()),
                _ => {}
            }
        }
        report
    }
}

/// `url` with its authority replaced by `localhost:<port>`, for opening the
/// forwarded server in a local browser.
pub fn localize_url(url: &str, port: u16) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let path = rest.find('/').map(|i| &rest[i..]).unwrap_or("");
    format!("{scheme}://localhost:{port}{path}")
}
