use anyhow::Context;
use clap::Parser;
use fleetd::Parameters;
use fleetd_api::{Delimiters, Peer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    #[clap(long = "listen", env = "FLEETD_LISTEN", default_value = "0.0.0.0:8003")]
    pub listen: std::net::SocketAddr,

    /// Address other nodes reach this one at
    #[clap(long = "advertise", env = "IP")]
    pub advertise: Option<String>,

    /// Nodes to join through, `host[:port]`, tried in order
    #[clap(long = "seeds", env = "SEEDS", value_delimiter = ',')]
    pub seeds: Vec<String>,

    /// File with `SEEDS=` and `IP=` lines, used for whatever isn't given otherwise
    #[clap(long = "env-file")]
    pub env_file: Option<PathBuf>,

    #[clap(long = "assume-leader")]
    pub assume_leader: bool,

    #[clap(long = "db-addr", env = "FLEETD_DB_ADDR", default_value = Parameters::DEFAULT_DB_ADDR)]
    pub db_addr: String,

    #[clap(long = "db-port", env = "FLEETD_DB_PORT", default_value_t = Parameters::DEFAULT_DB_PORT)]
    pub db_port: u16,

    #[clap(long = "heartbeat-ms")]
    pub heartbeat_ms: Option<u64>,

    #[clap(long = "field-delimiter", value_parser = parse_delimiter, default_value = "?")]
    pub field_delimiter: u8,

    #[clap(long = "entry-delimiter", value_parser = parse_delimiter, default_value = "\\n")]
    pub entry_delimiter: u8,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }

    pub fn to_params(&self) -> anyhow::Result<Parameters> {
        let env_file = match &self.env_file {
            Some(path) => read_env_file(path)
                .with_context(|| format!("reading env file {}", path.display()))?,
            None => EnvFile::default(),
        };

        let seeds = if self.seeds.is_empty() {
            &env_file.seeds
        } else {
            &self.seeds
        };
        let seeds = parse_seeds(seeds)?;
        let advertise = self.advertise.clone().or(env_file.ip);

        let heartbeat_period = self
            .heartbeat_ms
            .map_or(Parameters::DEFAULT_HEARTBEAT_PERIOD, Duration::from_millis);

        Ok(Parameters::builder()
            .bind(self.listen)
            .advertise(advertise)
            .seeds(seeds)
            .assume_leader(self.assume_leader)
            .db(Peer::new(self.db_addr.clone(), self.db_port))
            .delimiters(Delimiters {
                field: self.field_delimiter,
                entry: self.entry_delimiter,
            })
            .heartbeat_period(heartbeat_period)
            .leader_timeout(heartbeat_period.saturating_mul(10))
            .build())
    }
}

fn parse_seeds(seeds: &[String]) -> anyhow::Result<Vec<Peer>> {
    seeds
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            Peer::parse_host_port(s, Parameters::DEFAULT_PORT)
                .with_context(|| format!("invalid seed: {s}"))
        })
        .collect()
}

/// Single byte, or one of the `\n`, `\t`, `\r`, `\0` escapes
fn parse_delimiter(s: &str) -> std::result::Result<u8, String> {
    match s {
        "\\n" => Ok(b'\n'),
        "\\t" => Ok(b'\t'),
        "\\r" => Ok(b'\r'),
        "\\0" => Ok(b'\0'),
        _ => match s.as_bytes() {
            [b] if b.is_ascii() => Ok(*b),
            _ => Err(format!("delimiter must be a single ascii character, got {s:?}")),
        },
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct EnvFile {
    pub seeds: Vec<String>,
    pub ip: Option<String>,
}

pub fn read_env_file(path: &Path) -> io::Result<EnvFile> {
    Ok(parse_env_file(&fs::read_to_string(path)?))
}

fn parse_env_file(content: &str) -> EnvFile {
    let mut env = EnvFile::default();
    for line in content.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "SEEDS" => {
                env.seeds = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
            "IP" if !value.is_empty() => env.ip = Some(value.to_owned()),
            _ => {}
        }
    }
    env
}

#[test]
fn parse_delimiter_test() {
    assert_eq!(parse_delimiter("?"), Ok(b'?'));
    assert_eq!(parse_delimiter("\\n"), Ok(b'\n'));
    assert_eq!(parse_delimiter("\\0"), Ok(0));
    assert!(parse_delimiter("").is_err());
    assert!(parse_delimiter("ab").is_err());
    assert!(parse_delimiter("é").is_err());
}

#[test]
fn env_file_test() -> anyhow::Result<()> {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "# fleet bootstrap")?;
    writeln!(file, "SEEDS=10.0.0.1, 10.0.0.2:9000,,")?;
    writeln!(file, "IP=\"10.0.0.3\"")?;
    writeln!(file, "OTHER=x")?;

    let env = read_env_file(file.path())?;
    assert_eq!(
        env,
        EnvFile {
            seeds: vec!["10.0.0.1".into(), "10.0.0.2:9000".into()],
            ip: Some("10.0.0.3".into()),
        }
    );
    assert_eq!(
        parse_seeds(&env.seeds)?,
        vec![Peer::new("10.0.0.1", 8003), Peer::new("10.0.0.2", 9000)]
    );
    assert!(parse_seeds(&["10.0.0.1:port".to_owned()]).is_err());
    Ok(())
}

#[test]
fn flags_win_over_env_file() -> anyhow::Result<()> {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "SEEDS=10.0.0.1\nIP=10.0.0.3")?;
    let path = file.path().to_string_lossy().into_owned();

    let opts = Opts::try_parse_from([
        "fleetd",
        "--env-file",
        &path,
        "--advertise",
        "node-a",
        "--heartbeat-ms",
        "200",
    ])?;
    let params = opts.to_params()?;
    assert_eq!(params.advertise.as_deref(), Some("node-a"));
    assert_eq!(params.seeds, vec![Peer::new("10.0.0.1", 8003)]);
    assert_eq!(params.heartbeat_period, Duration::from_millis(200));
    assert_eq!(params.leader_timeout, Duration::from_secs(2));

    let opts = Opts::try_parse_from(["fleetd", "--env-file", &path, "--seeds", "a:1,b"])?;
    assert_eq!(
        opts.to_params()?.seeds,
        vec![Peer::new("a", 1), Peer::new("b", 8003)]
    );
    Ok(())
}
