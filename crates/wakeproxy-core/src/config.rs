use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::{ConfigError, ConfigProblem};

/// One listening port and the backend URL requests on it are forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMap {
    pub listen_port: u16,
    pub destination: Url,
}

/// The three durations that drive the lifecycle state machine and health
/// probing: how long to wait for a cold start, how long to stay up after
/// the last request, and how long a single health-check round trip may
/// take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub wake: Duration,
    pub drain: Duration,
    pub health_check: Duration,
}

impl Timeouts {
    pub fn validate(&self, problems: &mut Vec<ConfigProblem>) {
        if self.wake.is_zero() {
            problems.push(ConfigProblem::ZeroWakeTimeout);
        }
        if self.drain.is_zero() {
            problems.push(ConfigProblem::ZeroDrainTimeout);
        }
        if self.health_check.is_zero() {
            problems.push(ConfigProblem::ZeroHealthCheckTimeout);
        }
    }
}

/// Full configuration for one wakeproxy instance: the ports it fronts, the
/// backend it launches on demand, and the timeouts governing both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port_maps: Vec<PortMap>,
    pub timeouts: Timeouts,
    pub health_check_path: String,
    pub command: String,
    pub args: Vec<String>,
    pub pid_path: PathBuf,
}

impl Config {
    /// Validates every field and returns every problem found, rather than
    /// stopping at the first one — a single bad `--port` flag shouldn't
    /// hide a second, unrelated mistake in `--command`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.port_maps.is_empty() {
            problems.push(ConfigProblem::NoPortMaps);
        }

        let mut seen_ports = std::collections::HashSet::new();
        for port_map in &self.port_maps {
            if !seen_ports.insert(port_map.listen_port) {
                problems.push(ConfigProblem::DuplicatePort(port_map.listen_port));
            }
        }

        if self.command.trim().is_empty() {
            problems.push(ConfigProblem::EmptyCommand);
        }

        self.timeouts.validate(&mut problems);

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError(problems))
        }
    }
}

/// Parses a `listen_port:destination_url` pair as accepted on the command
/// line, e.g. `8080:http://127.0.0.1:3000`.
pub fn parse_port_map(raw: &str) -> Result<PortMap, ConfigProblem> {
    let (port_part, dest_part) = raw
        .split_once(':')
        .ok_or_else(|| ConfigProblem::InvalidDestination(raw.to_string(), "missing ':'".into()))?;

    let raw_port: u32 = port_part
        .parse()
        .map_err(|_| ConfigProblem::InvalidListenPort(0))?;
    let listen_port: u16 = raw_port
        .try_into()
        .map_err(|_| ConfigProblem::InvalidListenPort(raw_port))?;

    let destination = Url::parse(dest_part)
        .map_err(|e| ConfigProblem::InvalidDestination(dest_part.to_string(), e.to_string()))?;

    Ok(PortMap {
        listen_port,
        destination,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        Config {
            port_maps: vec![PortMap {
                listen_port: 8080,
                destination: Url::parse("http://127.0.0.1:3000").unwrap(),
            }],
            timeouts: Timeouts {
                wake: Duration::from_secs(60),
                drain: Duration::from_secs(300),
                health_check: Duration::from_secs(5),
            },
            health_check_path: "/health".to_string(),
            command: "./backend".to_string(),
            args: vec![],
            pid_path: PathBuf::from("/tmp/wakeproxy.pid"),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn collects_every_problem_at_once() {
        let mut config = sample_config();
        config.command = "   ".to_string();
        config.timeouts.wake = Duration::ZERO;
        config.port_maps.push(config.port_maps[0].clone());

        let err = config.validate().unwrap_err();
        assert_eq!(err.0.len(), 3);
        assert!(err.0.contains(&ConfigProblem::EmptyCommand));
        assert!(err.0.contains(&ConfigProblem::ZeroWakeTimeout));
        assert!(err.0.contains(&ConfigProblem::DuplicatePort(8080)));
    }

    #[test]
    fn parses_port_map_flag() {
        let parsed = parse_port_map("9090:http://localhost:4000").unwrap();
        assert_eq!(parsed.listen_port, 9090);
        assert_eq!(parsed.destination.as_str(), "http://localhost:4000/");
    }

    #[test]
    fn rejects_port_map_without_destination() {
        assert!(parse_port_map("9090").is_err());
    }
}
