use keyward_core::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const AUTH_SOCK_VAR: &str = "SSH_AUTH_SOCK";
pub const AGENT_PID_VAR: &str = "SSH_AGENT_PID";

static ASSIGNMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)=").expect("assignment pattern"));

/// Environment announced by a freshly started agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEnv {
    vars: BTreeMap<String, String>,
}

impl AgentEnv {
    /// Parses `ssh-agent`'s Bourne-shell announcement:
    ///
    /// ```text
    /// SSH_AUTH_SOCK=/tmp/ssh-XXXX/agent.123; export SSH_AUTH_SOCK;
    /// SSH_AGENT_PID=124; export SSH_AGENT_PID;
    /// echo Agent pid 124;
    /// ```
    ///
    /// Each value runs from `=` to the next `;` (or line end, or end of
    /// input when the last terminator is missing). The first announcement of
    /// a name wins. Fails when `SSH_AUTH_SOCK` is absent or empty.
    pub fn parse(output: &str) -> Result<Self> {
        let mut vars = BTreeMap::new();
        let mut pos = 0;
        while pos < output.len() {
            let caps = match ASSIGNMENT.captures(&output[pos..]) {
                Some(c) => c,
                None => break,
            };
            let (name, value_start) = match (caps.get(1), caps.get(0)) {
                (Some(n), Some(m)) => (n.as_str().to_string(), pos + m.end()),
                _ => break,
            };
            let rest = &output[value_start..];
            let value_len = rest.find([';', '\n']).unwrap_or(rest.len());
            let value = rest[..value_len].trim();
            if !value.is_empty() {
                vars.entry(name).or_insert_with(|| value.to_string());
            }
            pos = value_start + value_len;
        }

        if !vars.contains_key(AUTH_SOCK_VAR) {
            return Err(Error::Bootstrap(format!(
                "ssh-agent output did not announce {}: {}",
                AUTH_SOCK_VAR,
                output.trim()
            )));
        }
        Ok(Self { vars })
    }

    pub fn from_vars(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    pub fn socket(&self) -> Option<&str> {
        self.vars.get(AUTH_SOCK_VAR).map(String::as_str)
    }

    pub fn pid(&self) -> Option<u32> {
        self.vars.get(AGENT_PID_VAR).and_then(|p| p.parse().ok())
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }
}
