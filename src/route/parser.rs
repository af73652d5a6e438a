//! The textual routing command language.
//!
//! One command per line, LF-terminated, `#` starts a comment:
//!
//! ```text
//! route add <svc> <host>[/<path>] <url> [weight <w>] [tags "<t>,<t>"] [opts "k=v k=v"]
//! route del <svc> [<host>[/<path>]]
//! route weight <svc> <host>[/<path>] weight <w> tags "<t>,<t>"
//! ```
//!
//! Malformed lines are skipped with a warning; a batch containing at least
//! one valid rule still publishes. Lines are applied in the order given:
//! the caller is expected to have reverse-sorted them already.

use tracing::warn;
use url::Url;

use super::target::TargetOpts;

/// One parsed routing command.
#[derive(Debug, Clone)]
pub enum RuleCmd {
    Add {
        service: String,
        host: String,
        path: String,
        url: Url,
        weight: Option<f64>,
        tags: Vec<String>,
        opts: TargetOpts,
    },
    Del {
        service: String,
        host: Option<String>,
        path: Option<String>,
    },
    Weight {
        service: String,
        host: String,
        path: String,
        weight: f64,
        tags: Vec<String>,
    },
}

/// Split a line into tokens with shell-style double quoting.
///
/// Quotes group whitespace into one token; `\"` inside quotes escapes the
/// quote character. Returns an error on an unterminated quote.
fn tokenize(line: &str) -> Result<Vec<String>, &'static str> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut has_token = false;

    for c in line.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token || !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if in_quotes {
        return Err("unterminated quote");
    }
    if has_token || !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Split `host[/path]` into its parts. A missing path means `/`.
fn split_dst(dst: &str) -> (String, String) {
    match dst.split_once('/') {
        Some((host, path)) => (host.to_string(), format!("/{path}")),
        None => (dst.to_string(), "/".to_string()),
    }
}

fn split_tags(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Optional `weight`/`tags`/`opts` clauses, in any order.
#[derive(Default)]
struct Clauses {
    weight: Option<f64>,
    tags: Vec<String>,
    opts: TargetOpts,
}

fn parse_clauses(tokens: &[String]) -> Result<Clauses, String> {
    let mut clauses = Clauses::default();
    let mut iter = tokens.iter();
    while let Some(key) = iter.next() {
        let Some(value) = iter.next() else {
            return Err(format!("missing value for {key:?}"));
        };
        match key.as_str() {
            "weight" => {
                let w: f64 = value
                    .parse()
                    .map_err(|_| format!("invalid weight {value:?}"))?;
                if w < 0.0 {
                    return Err(format!("negative weight {value:?}"));
                }
                clauses.weight = Some(w);
            }
            "tags" => clauses.tags = split_tags(value),
            "opts" => clauses.opts = TargetOpts::parse(value),
            other => return Err(format!("unknown clause {other:?}")),
        }
    }
    Ok(clauses)
}

fn parse_line(tokens: &[String]) -> Result<RuleCmd, String> {
    match tokens {
        [route, add, service, dst, url, rest @ ..] if route == "route" && add == "add" => {
            let (host, path) = split_dst(dst);
            let url: Url = url.parse().map_err(|e| format!("invalid url {url:?}: {e}"))?;
            let clauses = parse_clauses(rest)?;
            Ok(RuleCmd::Add {
                service: service.clone(),
                host,
                path,
                url,
                weight: clauses.weight,
                tags: clauses.tags,
                opts: clauses.opts,
            })
        }
        [route, del, service] if route == "route" && del == "del" => Ok(RuleCmd::Del {
            service: service.clone(),
            host: None,
            path: None,
        }),
        [route, del, service, dst] if route == "route" && del == "del" => {
            let (host, path) = split_dst(dst);
            Ok(RuleCmd::Del {
                service: service.clone(),
                host: Some(host),
                path: Some(path),
            })
        }
        [route, weight, service, dst, rest @ ..] if route == "route" && weight == "weight" => {
            let (host, path) = split_dst(dst);
            let clauses = parse_clauses(rest)?;
            let Some(weight) = clauses.weight else {
                return Err("route weight requires a weight clause".to_string());
            };
            Ok(RuleCmd::Weight {
                service: service.clone(),
                host,
                path,
                weight,
                tags: clauses.tags,
            })
        }
        _ => Err("unknown command".to_string()),
    }
}

/// Parse a rule-text batch. Bad lines are dropped with a warning; the order
/// of the surviving commands is the order of the input.
pub fn parse_rules(text: &str) -> Vec<RuleCmd> {
    let mut cmds = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens = match tokenize(line) {
            Ok(tokens) => tokens,
            Err(err) => {
                warn!(line = lineno + 1, err, "skipping unparsable rule");
                continue;
            }
        };
        if tokens.is_empty() {
            continue;
        }
        match parse_line(&tokens) {
            Ok(cmd) => cmds.push(cmd),
            Err(err) => warn!(line = lineno + 1, err, rule = line, "skipping invalid rule"),
        }
    }
    cmds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::target::ProxyProto;

    #[test]
    fn test_tokenize_quoting() {
        let tokens = tokenize(r#"route add svc host/ http://u opts "a=1 b=2" tags "x,y""#).unwrap();
        assert_eq!(
            tokens,
            vec!["route", "add", "svc", "host/", "http://u", "opts", "a=1 b=2", "tags", "x,y"]
        );
    }

    #[test]
    fn test_tokenize_escaped_quote() {
        let tokens = tokenize(r#"opts "say \"hi\"""#).unwrap();
        assert_eq!(tokens, vec!["opts", r#"say "hi""#]);
    }

    #[test]
    fn test_tokenize_unterminated_quote() {
        assert!(tokenize(r#"opts "unclosed"#).is_err());
    }

    #[test]
    fn test_parse_full_add() {
        let cmds = parse_rules(
            "route add svc www.example.com/a http://10.0.0.1:8080 weight 0.5 tags \"a,b\" opts \"pxyproto=v1\"\n",
        );
        assert_eq!(cmds.len(), 1);
        let RuleCmd::Add {
            service,
            host,
            path,
            weight,
            tags,
            opts,
            ..
        } = &cmds[0]
        else {
            panic!("expected add");
        };
        assert_eq!(service, "svc");
        assert_eq!(host, "www.example.com");
        assert_eq!(path, "/a");
        assert_eq!(*weight, Some(0.5));
        assert_eq!(tags, &["a", "b"]);
        assert_eq!(opts.proxy_proto, ProxyProto::V1);
    }

    #[test]
    fn test_parse_add_without_path() {
        let cmds = parse_rules("route add svc example.com http://10.0.0.1:8080\n");
        let RuleCmd::Add { host, path, .. } = &cmds[0] else {
            panic!("expected add");
        };
        assert_eq!(host, "example.com");
        assert_eq!(path, "/");
    }

    #[test]
    fn test_parse_del_forms() {
        let cmds = parse_rules("route del svc\nroute del svc www.example.com/a\n");
        assert!(matches!(
            &cmds[0],
            RuleCmd::Del { host: None, path: None, .. }
        ));
        let RuleCmd::Del { host, path, .. } = &cmds[1] else {
            panic!("expected del");
        };
        assert_eq!(host.as_deref(), Some("www.example.com"));
        assert_eq!(path.as_deref(), Some("/a"));
    }

    #[test]
    fn test_parse_weight() {
        let cmds = parse_rules("route weight svc www.example.com/ weight 2 tags \"blue\"\n");
        let RuleCmd::Weight { weight, tags, .. } = &cmds[0] else {
            panic!("expected weight");
        };
        assert_eq!(*weight, 2.0);
        assert_eq!(tags, &["blue"]);
    }

    #[test]
    fn test_bad_lines_are_skipped_not_fatal() {
        let cmds = parse_rules(
            "# comment\n\
             \n\
             bogus verb here\n\
             route add broken\n\
             route add svc example.com/ not a url\n\
             route add svc example.com/ http://10.0.0.1:8080\n",
        );
        assert_eq!(cmds.len(), 1);
        assert!(matches!(&cmds[0], RuleCmd::Add { .. }));
    }

    #[test]
    fn test_parser_preserves_caller_order() {
        let cmds = parse_rules(
            "route add b example.com/ http://b:80\n\
             route add a example.com/ http://a:80\n",
        );
        let services: Vec<_> = cmds
            .iter()
            .map(|c| match c {
                RuleCmd::Add { service, .. } => service.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(services, vec!["b", "a"]);
    }
}
