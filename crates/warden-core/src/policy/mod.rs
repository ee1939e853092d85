//! Trusted-data and tool-invocation policy evaluation.

pub mod matcher;
mod tool_invocation;
mod trusted_data;

use std::collections::HashSet;

use warden_common::PolicySet;
use warden_provider_core::{Headers, header_get};

pub use tool_invocation::ToolInvocationEvaluator;
pub use trusted_data::{TrustVerdict, TrustedDataEvaluator};

/// Names the caller declares usable; comma separated.
pub const ENABLED_TOOLS_HEADER: &str = "x-warden-enabled-tools";

/// Tools permitted under the restrictive policy: the caller's declared list
/// plus every tool the agent has a config for. Tools merely present in the
/// request body are not enabled by that alone.
pub fn enabled_tools(headers: &Headers, policies: &PolicySet) -> HashSet<String> {
    let mut enabled: HashSet<String> = header_get(headers, ENABLED_TOOLS_HEADER)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    enabled.extend(policies.tool_configs.iter().map(|config| config.tool_name.clone()));
    enabled
}

#[cfg(test)]
mod tests {
    use warden_common::{ToolConfig, ToolResultTreatment};

    use super::*;

    #[test]
    fn header_and_configs_are_merged() {
        let headers: Headers = vec![(ENABLED_TOOLS_HEADER.into(), " get_weather , ,search".into())];
        let policies = PolicySet {
            tool_configs: vec![ToolConfig {
                tool_name: "get_time".into(),
                allow_usage_when_untrusted_data_is_present: false,
                tool_result_treatment: ToolResultTreatment::Trusted,
            }],
            ..Default::default()
        };
        let mut names: Vec<_> = enabled_tools(&headers, &policies).into_iter().collect();
        names.sort();
        assert_eq!(names, vec!["get_time", "get_weather", "search"]);
    }

    #[test]
    fn nothing_is_enabled_by_default() {
        assert!(enabled_tools(&Vec::new(), &PolicySet::default()).is_empty());
    }
}
