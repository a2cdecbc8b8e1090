use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Keys §6 requires stripped from any environment handed to a subprocess or logged.
pub const ENV_STRIP_LIST: [&str; 2] = ["GP_REMOTE_PWD", "LS_COLORS"];

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap())
}

/// Substitutes `{kernel_id}`, `{response_address}`, `{public_key}`, `{port_range}` (or any
/// other key present in `values`) into each argv token. Unknown `{name}` placeholders are
/// left untouched (P4: order-independent, unknown braces preserved).
pub fn substitute_argv(argv: &[String], values: &HashMap<&str, String>) -> Vec<String> {
    let re = placeholder_re();
    argv.iter()
        .map(|token| {
            re.replace_all(token, |caps: &regex::Captures| {
                let name = &caps[1];
                match values.get(name) {
                    Some(v) => v.clone(),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
        })
        .collect()
}

/// Removes the always-sensitive keys from an environment map before it's handed to a
/// subprocess or written to a log (§6, P3).
pub fn strip_sensitive_env(env: &mut HashMap<String, String>) {
    for key in ENV_STRIP_LIST {
        env.remove(key);
    }
}

/// DNS-safe pod/container name derivation used by the Kubernetes and container backends:
/// lowercase, collapse non-alphanumeric runs to a single `-`, trim leading/trailing `-`.
pub fn dns_safe_name(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_was_dash = false;
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_placeholders_and_preserves_unknown() {
        let argv = vec!["run".to_string(), "--id={kernel_id}".to_string(), "--x={nope}".to_string()];
        let mut values = HashMap::new();
        values.insert("kernel_id", "abc-123".to_string());
        let out = substitute_argv(&argv, &values);
        assert_eq!(out, vec!["run", "--id=abc-123", "--x={nope}"]);
    }

    #[test]
    fn substitution_is_order_independent() {
        let argv = vec!["{b}{a}".to_string()];
        let mut values = HashMap::new();
        values.insert("a", "1".to_string());
        values.insert("b", "2".to_string());
        assert_eq!(substitute_argv(&argv, &values), vec!["21".to_string()]);
    }

    #[test]
    fn strip_sensitive_env_removes_exactly_the_strip_list() {
        let mut env = HashMap::new();
        env.insert("GP_REMOTE_PWD".to_string(), "hunter2".to_string());
        env.insert("LS_COLORS".to_string(), "rs=0".to_string());
        env.insert("KERNEL_ID".to_string(), "k1".to_string());
        strip_sensitive_env(&mut env);
        assert!(!env.contains_key("GP_REMOTE_PWD"));
        assert!(!env.contains_key("LS_COLORS"));
        assert_eq!(env.get("KERNEL_ID"), Some(&"k1".to_string()));
    }

    #[test]
    fn dns_safe_name_collapses_and_trims() {
        assert_eq!(dns_safe_name("Alice_123!!Kernel"), "alice-123-kernel");
        assert_eq!(dns_safe_name("--weird--"), "weird");
    }
}
