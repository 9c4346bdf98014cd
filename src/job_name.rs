//! Deterministic job names.
//!
//! The name doubles as the deduplication key: two invocations with the same
//! base name, resource list, parallel environment and project map to the same
//! job. Jobs submitted earlier under this scheme are found again only if the
//! derivation stays exactly as it is.

use crate::options::Invocation;

/// A `-pe` value that asks for no parallelism and is left out of names.
pub const NO_PARALLEL_ENV: &str = "smp 1";

/// Resource name of the wall-clock limit inside `-l`.
pub const RUNTIME_RESOURCE: &str = "h_rt";

/// Unit letters for runtime fields, smallest first.
const RUNTIME_UNITS: [char; 4] = ['s', 'm', 'h', 'd'];

const FORBIDDEN: [char; 9] = ['\n', '\t', '\r', '/', ':', '@', '\\', '*', '?'];

/// Name for the job described by `inv`.
pub fn job_name_for(inv: &Invocation) -> String {
    derive_job_name(
        &inv.base_name,
        inv.qsub.get("-l"),
        inv.qsub.get("-pe"),
        inv.qsub.get("-P"),
    )
}

/// Build `<base>.<suffix>` from the resource list, parallel environment and
/// project. Absent or empty parts contribute nothing.
pub fn derive_job_name(
    base: &str,
    resources: Option<&str>,
    parallel_env: Option<&str>,
    project: Option<&str>,
) -> String {
    let mut fragments: Vec<String> = Vec::new();

    if let Some(resources) = resources {
        fragments.extend(
            resources
                .split(',')
                .filter(|entry| !entry.is_empty())
                .map(|entry| abbreviate_runtime(entry).unwrap_or_else(|| entry.to_string())),
        );
    }
    if let Some(pe) = parallel_env.filter(|pe| !pe.is_empty() && *pe != NO_PARALLEL_ENV) {
        fragments.push(pe.to_string());
    }
    if let Some(project) = project.filter(|p| !p.is_empty()) {
        fragments.push(project.to_string());
    }

    let suffix = sanitize(&fragments.join("."));
    if suffix.is_empty() {
        base.to_string()
    } else {
        format!("{base}.{suffix}")
    }
}

/// Abbreviate an `h_rt=<fields>` entry: `h_rt=9:0:0` becomes `9h`,
/// `h_rt=1:2:3:4` becomes `1d2h3m4s`.
///
/// Returns `None` for anything that is not a runtime entry with one to four
/// numeric fields.
pub fn abbreviate_runtime(entry: &str) -> Option<String> {
    let (key, value) = entry.split_once('=')?;
    if key.trim() != RUNTIME_RESOURCE {
        return None;
    }

    let fields: Vec<u64> = value
        .split(':')
        .map(|f| f.trim().parse::<u64>())
        .collect::<Result<_, _>>()
        .ok()?;
    if fields.is_empty() || fields.len() > RUNTIME_UNITS.len() {
        return None;
    }

    let units = RUNTIME_UNITS[..fields.len()].iter().rev();
    let abbreviated: String = fields
        .iter()
        .zip(units)
        .filter(|(amount, _)| **amount != 0)
        .map(|(amount, unit)| format!("{amount}{unit}"))
        .collect();

    if abbreviated.is_empty() {
        Some("0s".to_string())
    } else {
        Some(abbreviated)
    }
}

/// Make a fragment safe for a qsub job name.
pub fn sanitize(fragment: &str) -> String {
    let replaced: String = fragment
        .chars()
        .map(|c| match c {
            c if FORBIDDEN.contains(&c) => '.',
            ' ' => '_',
            c => c,
        })
        .collect();
    replaced.trim_matches(|c| c == '.' || c == '_').to_string()
}
