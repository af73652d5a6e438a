//! Turning service tags into routing commands.
//!
//! A routable tag has the form `<prefix><host>[/<path>]` optionally followed
//! by whitespace-separated `key=value` options:
//!
//! ```text
//! urlprefix-www.example.com/ weight=0.5 proto=https pxyproto=v1
//! ```
//!
//! `weight=` and `tags=` map to the rule's weight and tags clauses,
//! `proto=` selects the target url scheme, everything else passes through
//! into the `opts` clause. `{DC}` in the host/path expands to the local
//! datacenter.

use tracing::warn;

use super::client::CatalogService;

/// Build the `route add` lines for one catalog instance.
pub fn build(svc: &CatalogService, tag_prefix: &str, dc: &str) -> Vec<String> {
    let addr = if svc.service_address.is_empty() {
        &svc.address
    } else {
        &svc.service_address
    };

    let mut cmds = Vec::new();
    for tag in &svc.service_tags {
        let Some(spec) = tag.strip_prefix(tag_prefix) else {
            continue;
        };
        let spec = spec.replace("{DC}", dc);

        let mut parts = spec.split_whitespace();
        let Some(dst) = parts.next() else {
            warn!(service = %svc.service_name, tag, "ignoring tag with empty route spec");
            continue;
        };

        let mut scheme = "http";
        let mut weight = None;
        let mut rule_tags = None;
        let mut opts = Vec::new();
        for part in parts {
            if let Some(value) = part.strip_prefix("weight=") {
                match value.parse::<f64>() {
                    Ok(w) if w >= 0.0 => weight = Some(w),
                    _ => warn!(service = %svc.service_name, tag, "ignoring invalid weight"),
                }
            } else if let Some(value) = part.strip_prefix("tags=") {
                rule_tags = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("proto=") {
                scheme = match value {
                    "https" => "https",
                    "http" => "http",
                    other => {
                        warn!(service = %svc.service_name, tag, proto = other, "ignoring unknown proto");
                        scheme
                    }
                };
            } else {
                opts.push(part);
            }
        }

        let mut cmd = format!(
            "route add {} {} {}://{}:{}",
            svc.service_name, dst, scheme, addr, svc.service_port
        );
        if let Some(w) = weight {
            cmd.push_str(&format!(" weight {w}"));
        }
        if let Some(tags) = rule_tags {
            cmd.push_str(&format!(" tags \"{tags}\""));
        }
        if !opts.is_empty() {
            cmd.push_str(&format!(" opts \"{}\"", opts.join(" ")));
        }
        cmds.push(cmd);
    }
    cmds
}
