use chrono::NaiveDate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run one full load for an address and print the resulting view.
    View {
        address: String,
        chain: Option<String>,
        since: Option<i64>,
    },
    /// Print the cached snapshot listing without touching the network.
    Cached { address: String },
}

const USAGE: &str = "usage: aggregator view <address> [--chain <id>] [--since <unix_ts|YYYY-MM-DD>] | aggregator cached <address>";

pub fn parse_args<I>(mut args: I) -> std::result::Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Err(USAGE.to_string());
    };

    match cmd.as_str() {
        "view" => {
            let address = args.next().ok_or_else(|| USAGE.to_string())?;
            let mut chain = None;
            let mut since = None;
            while let Some(flag) = args.next() {
                match flag.as_str() {
                    "--chain" => {
                        chain = Some(args.next().ok_or_else(|| USAGE.to_string())?);
                    }
                    "--since" => {
                        let raw = args.next().ok_or_else(|| USAGE.to_string())?;
                        since = Some(parse_since(&raw)?);
                    }
                    other => return Err(format!("unknown flag: {other}")),
                }
            }
            Ok(Command::View {
                address,
                chain,
                since,
            })
        }
        "cached" => {
            let address = args.next().ok_or_else(|| USAGE.to_string())?;
            Ok(Command::Cached { address })
        }
        other => Err(format!("unknown command: {other}")),
    }
}

fn parse_since(raw: &str) -> std::result::Result<i64, String> {
    if let Ok(ts) = raw.parse::<i64>() {
        return Ok(ts);
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| format!("invalid --since value: {raw}"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| format!("invalid --since value: {raw}"))?;
    Ok(midnight.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> impl Iterator<Item = String> {
        std::iter::once("aggregator".to_string())
            .chain(parts.iter().map(|s| (*s).to_string()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_parse_view_with_flags() {
        let cmd = parse_args(args(&["view", "0xabc", "--chain", "eth", "--since", "1700000000"]))
            .unwrap();
        assert_eq!(
            cmd,
            Command::View {
                address: "0xabc".to_string(),
                chain: Some("eth".to_string()),
                since: Some(1_700_000_000),
            }
        );
    }

    #[test]
    fn test_parse_view_minimal() {
        let cmd = parse_args(args(&["view", "0xabc"])).unwrap();
        assert_eq!(
            cmd,
            Command::View {
                address: "0xabc".to_string(),
                chain: None,
                since: None,
            }
        );
    }

    #[test]
    fn test_parse_since_date_form() {
        let cmd = parse_args(args(&["view", "0xabc", "--since", "2024-01-01"])).unwrap();
        let Command::View { since, .. } = cmd else {
            panic!("expected view command");
        };
        assert_eq!(since, Some(1_704_067_200));
    }

    #[test]
    fn test_parse_cached() {
        let cmd = parse_args(args(&["cached", "0xabc"])).unwrap();
        assert_eq!(
            cmd,
            Command::Cached {
                address: "0xabc".to_string()
            }
        );
    }

    #[test]
    fn test_no_command_is_an_error() {
        assert!(parse_args(args(&[])).is_err());
    }

    #[test]
    fn test_unknown_flag_is_an_error() {
        assert!(parse_args(args(&["view", "0xabc", "--nope"])).is_err());
    }
}
