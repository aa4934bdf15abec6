//! `platformio.ini` reader and OTA upload settings.
//!
//! Parses the INI dialect PlatformIO uses and resolves the handful of keys the
//! upload hook cares about for one build environment.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use log::{debug, warn};
use url::Url;

use crate::error::{OtaError, Result};

/// OTA store used when neither the CLI nor the project file names one.
pub const DEFAULT_BASE_URL: &str = "http://core.voneicken.com:1880";

/// Common section every `[env:*]` inherits from.
const COMMON_ENV: &str = "env";
const OTA_SECTION: &str = "mqtt_ota";

const MAX_INTERPOLATION_DEPTH: usize = 8;

/// Parsed project configuration: section name → (key → raw value).
#[derive(Debug, Clone, Default)]
pub struct ProjectConfig {
    sections: HashMap<String, HashMap<String, String>>,
}

/// Values given on the command line; they win over the project file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub url:    Option<String>,
    pub device: Option<String>,
}

/// Everything the uploader needs from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaSettings {
    /// Scheme, host and port of the OTA store, without a trailing `/`.
    pub base_url: String,
    /// Device to notify once the image is stored; `None` means no header.
    pub device:   Option<String>,
}

/// Read and parse the project file at `path`.
pub fn load_config(path: &Path) -> Result<ProjectConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| OtaError::Config(format!("cannot read {}: {e}", path.display())))?;
    Ok(ProjectConfig::parse(&content))
}

impl ProjectConfig {
    pub fn parse(content: &str) -> Self {
        let mut cfg = ProjectConfig::default();
        let mut section: Option<String> = None;
        let mut last_key: Option<String> = None;

        for raw in content.lines() {
            let line = raw.trim();
            if line.is_empty() {
                last_key = None;
                continue;
            }
            if line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            // Indented line continues the previous value.
            if raw.starts_with([' ', '\t']) {
                if let (Some(sec), Some(key)) = (&section, &last_key) {
                    if let Some(val) = cfg.sections.get_mut(sec).and_then(|s| s.get_mut(key)) {
                        let more = strip_inline_comment(line);
                        if !more.is_empty() {
                            if !val.is_empty() {
                                val.push('\n');
                            }
                            val.push_str(more);
                        }
                        continue;
                    }
                }
            }

            if let Some((name, trailing)) = line.strip_prefix('[').and_then(|l| l.split_once(']')) {
                let trailing = trailing.trim();
                if !trailing.is_empty() && !trailing.starts_with([';', '#']) {
                    debug!("ignoring text after section header [{name}]: {trailing}");
                }
                let name = name.trim().to_string();
                cfg.sections.entry(name.clone()).or_default();
                section = Some(name);
                last_key = None;
                continue;
            }

            let Some(sec) = &section else {
                debug!("ignoring line outside any section: {line}");
                continue;
            };
            let Some(pos) = line.find(['=', ':']) else {
                debug!("ignoring malformed line in [{sec}]: {line}");
                continue;
            };
            let key = line[..pos].trim().to_ascii_lowercase();
            if key.is_empty() {
                continue;
            }
            let val = strip_inline_comment(line[pos + 1..].trim()).to_string();
            cfg.sections
                .entry(sec.clone())
                .or_default()
                .insert(key.clone(), val);
            last_key = Some(key);
        }

        cfg
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// Look up `key` in `section`, with `${...}` references expanded.
    pub fn get(&self, section: &str, key: &str) -> Option<String> {
        self.raw(section, key).map(|v| self.interpolate(v, 0))
    }

    /// Look up `key` for build environment `env`, following PlatformIO's
    /// inheritance: `[env:<env>]`, its `extends` chain, then `[env]`.
    pub fn env_get(&self, env: &str, key: &str) -> Option<String> {
        let key = key.to_ascii_lowercase();
        self.env_chain(env)
            .iter()
            .find_map(|sec| self.raw(sec, &key))
            .map(|v| self.interpolate(v, 0))
    }

    /// Resolve the upload settings for `env`.
    ///
    /// A missing section or key is not an error: the device header is simply
    /// left off and the default store is used.
    pub fn ota_settings(&self, env: &str, overrides: &Overrides) -> Result<OtaSettings> {
        if !self.has_section(&format!("env:{env}")) {
            warn!("no [env:{env}] section in project configuration");
        }

        let device = non_empty(overrides.device.clone())
            .or_else(|| non_empty(self.env_get(env, "mqtt_device")))
            .or_else(|| non_empty(self.get(OTA_SECTION, "device")));

        let base_url = non_empty(overrides.url.clone())
            .or_else(|| non_empty(self.env_get(env, "ota_url")))
            .or_else(|| non_empty(self.get(OTA_SECTION, "url")))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        Ok(OtaSettings {
            base_url: validate_base_url(&base_url)?,
            device,
        })
    }

    fn raw(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }

    fn env_chain(&self, env: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = vec![format!("env:{env}")];

        while let Some(sec) = queue.pop() {
            if !seen.insert(sec.clone()) {
                continue;
            }
            if let Some(ext) = self.raw(&sec, "extends") {
                // Preserve declaration order when pushing onto the stack.
                let parents: Vec<&str> = ext
                    .split([',', '\n'])
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect();
                queue.extend(parents.into_iter().rev().map(String::from));
            }
            chain.push(sec);
        }
        if !seen.contains(COMMON_ENV) {
            chain.push(COMMON_ENV.to_string());
        }
        chain
    }

    /// Expand `${section.key}` and `${sysenv.NAME}` references.
    /// Unresolvable references are left as written.
    fn interpolate(&self, value: &str, depth: usize) -> String {
        if depth >= MAX_INTERPOLATION_DEPTH || !value.contains("${") {
            return value.to_string();
        }
        let mut out = String::with_capacity(value.len());
        let mut rest = value;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let reference = &after[..end];
            match self.resolve_reference(reference, depth) {
                Some(v) => out.push_str(&v),
                None => {
                    warn!("unresolved reference ${{{reference}}}");
                    out.push_str(&rest[start..start + 2 + end + 1]);
                }
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out
    }

    fn resolve_reference(&self, reference: &str, depth: usize) -> Option<String> {
        let (section, key) = reference.split_once('.')?;
        if section == "sysenv" {
            return std::env::var(key).ok();
        }
        let raw = self.raw(section, &key.to_ascii_lowercase())?;
        Some(self.interpolate(raw, depth + 1))
    }
}

/// Check `raw` is an absolute http(s) URL and drop any trailing `/`.
pub fn validate_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let url = Url::parse(trimmed)?;
    match url.scheme() {
        "http" | "https" => Ok(trimmed.to_string()),
        other => Err(OtaError::Config(format!(
            "unsupported scheme '{other}' in OTA url {trimmed}"
        ))),
    }
}

/// Drop a trailing ` ; comment` from a value.
fn strip_inline_comment(val: &str) -> &str {
    let bytes = val.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b';' && i > 0 && bytes[i - 1].is_ascii_whitespace() {
            return val[..i].trim_end();
        }
    }
    val
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
