//! Argument vector for the analysis binary.

use crate::core::types::CapabilityOptions;

/// Combine the configured base arguments with a capability's tool and turn budgets.
///
/// The prompt itself is never passed as an argument; it goes to stdin.
pub fn build_args(base_args: &[String], options: &CapabilityOptions) -> Vec<String> {
    let mut args = base_args.to_vec();
    if !options.allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(options.allowed_tools.join(","));
    }
    if let Some(turns) = options.max_turns {
        args.push("--max-turns".to_string());
        args.push(turns.to_string());
    }
    args
}
