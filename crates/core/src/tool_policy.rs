//! Allow/deny filtering of the tools exposed to the model for one turn.
//!
//! A policy without an `allow` list admits every tool that is not denied.
//! Deny always wins over allow.

use serde::{Deserialize, Serialize};

use crate::domain::message::Channel;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny: Option<Vec<String>>,
}

impl ToolPolicy {
    pub fn allow<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { allow: Some(names.into_iter().map(Into::into).collect()), deny: None }
    }

    pub fn deny<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { allow: None, deny: Some(names.into_iter().map(Into::into).collect()) }
    }

    pub fn with_deny<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deny = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn admits(&self, name: &str) -> bool {
        if self.deny.as_ref().is_some_and(|deny| deny.iter().any(|denied| denied == name)) {
            return false;
        }
        match &self.allow {
            Some(allow) => allow.iter().any(|allowed| allowed == name),
            None => true,
        }
    }
}

/// Baseline policy for a channel.
///
/// Both channels are currently permissive.
pub fn default_policy(channel: Channel) -> ToolPolicy {
    match channel {
        Channel::Web => ToolPolicy::default(),
        Channel::WhatsApp => ToolPolicy::default(),
    }
}

/// Keeps the tools the policy admits, preserving input order.
pub fn filter_tools<T, F>(tools: Vec<T>, policy: &ToolPolicy, name_of: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    tools.into_iter().filter(|tool| policy.admits(name_of(tool))).collect()
}

/// Combines policies: deny lists are unioned, allow lists are intersected
/// across the policies that define one.
pub fn merge_tool_policies<'a, I>(policies: I) -> ToolPolicy
where
    I: IntoIterator<Item = &'a ToolPolicy>,
{
    let mut allow: Option<Vec<String>> = None;
    let mut deny: Option<Vec<String>> = None;

    for policy in policies {
        if let Some(policy_deny) = &policy.deny {
            let merged = deny.get_or_insert_with(Vec::new);
            for name in policy_deny {
                if !merged.contains(name) {
                    merged.push(name.clone());
                }
            }
        }

        if let Some(policy_allow) = &policy.allow {
            allow = Some(match allow {
                None => policy_allow.clone(),
                Some(current) => {
                    current.into_iter().filter(|name| policy_allow.contains(name)).collect()
                }
            });
        }
    }

    ToolPolicy { allow, deny }
}
