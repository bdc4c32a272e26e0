use concread::cowcell::asynch::{CowCell, CowCellWriteTxn};
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::enums::StubListenerMode;
use crate::error::StubNsError;
use crate::{DNS_STUB_ADDRESS, DNS_STUB_PORT};

/// An operator-configured extra listen endpoint, written as
/// `[mode:]address[:port]` - eg `udp:10.0.0.1:5300`, `[::1]:8053` or plain
/// `192.168.1.1`. Port 0 (or none) means the default DNS port at bind time.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExtraListener {
    pub mode: StubListenerMode,
    pub address: IpAddr,
    pub port: u16,
}

impl FromStr for ExtraListener {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (mode, rest) = match input.split_once(':') {
            Some((prefix, rest)) if StubListenerMode::from_str(prefix).is_ok() => {
                (StubListenerMode::from_str(prefix)?, rest)
            }
            _ => (StubListenerMode::Yes, input),
        };

        if let Ok(addr) = SocketAddr::from_str(rest) {
            return Ok(ExtraListener {
                mode,
                address: addr.ip(),
                port: addr.port(),
            });
        }
        if let Ok(address) = IpAddr::from_str(rest) {
            return Ok(ExtraListener {
                mode,
                address,
                port: 0,
            });
        }
        Err(format!(
            "Failed to parse extra listener {input:?}, wanted [mode:]address[:port]"
        ))
    }
}

impl TryFrom<String> for ExtraListener {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ExtraListener::from_str(&value)
    }
}

impl From<ExtraListener> for String {
    fn from(listener: ExtraListener) -> String {
        listener.to_string()
    }
}

impl Display for ExtraListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let address = match self.address {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        match self.port {
            0 => f.write_fmt(format_args!("{}:{}", self.mode, address)),
            port => f.write_fmt(format_args!("{}:{}:{}", self.mode, address, port)),
        }
    }
}

#[derive(Debug, Deserialize, Eq, PartialEq, Clone, Serialize)]
/// The main config blob for the stub listener, write this as a JSON file and
/// load it and it'll make things go.
pub struct ConfigFile {
    /// Which transports the primary stub serves: no/udp/tcp/yes
    pub stub_listener: StubListenerMode,
    /// The primary stub bind address, default is 127.0.0.53
    pub stub_address: String,
    /// The primary stub port, default is 53
    pub stub_port: u16,
    /// Additional listen endpoints as `[mode:]address[:port]` strings
    pub extra_listeners: Vec<ExtraListener>,
    /// Where the forwarding resolver sends queries, eg "192.0.2.1:53"
    pub upstream: Option<String>,
    /// Default is "info"
    pub log_level: String,
}

impl ConfigFile {
    /// JSONify the configfile in a pretty way using serde
    pub fn as_json_pretty(&self) -> Result<String, StubNsError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StubNsError::Config(format!("Failed to serialize config: {e:?}")))
    }

    /// Get a bindable SocketAddr for the primary stub listener
    pub fn stub_listener_address(&self) -> Result<SocketAddr, StubNsError> {
        let address = IpAddr::from_str(&self.stub_address).map_err(|error| {
            StubNsError::Config(format!(
                "Failed to parse stub_address {:?}: {error:?}",
                self.stub_address
            ))
        })?;
        Ok(SocketAddr::new(address, self.stub_port))
    }

    /// The upstream server for the forwarding resolver, if one is configured
    pub fn upstream_address(&self) -> Result<Option<SocketAddr>, StubNsError> {
        match &self.upstream {
            None => Ok(None),
            Some(upstream) => SocketAddr::from_str(upstream).map(Some).map_err(|error| {
                StubNsError::Config(format!(
                    "Failed to parse upstream {upstream:?}: {error:?}"
                ))
            }),
        }
    }

    /// Validates the configuration, reporting every problem at once
    pub async fn check_config(
        config: CowCellWriteTxn<'_, ConfigFile>,
    ) -> Result<(), Vec<String>> {
        let mut errors: Vec<String> = vec![];

        if let Err(error) = config.stub_listener_address() {
            errors.push(error.to_string());
        }
        if let Err(error) = config.upstream_address() {
            errors.push(error.to_string());
        }
        if tracing::Level::from_str(&config.log_level).is_err() {
            errors.push(format!("Invalid log_level {:?}", config.log_level));
        }

        config.commit().await;
        match errors.is_empty() {
            true => Ok(()),
            false => Err(errors),
        }
    }

    /// Uses [Self::try_from] and wraps it in a CowCell (moo)
    ///
    /// The default locations are `~/.config/stubns.json` and `./stubns.json`.
    pub fn try_as_cowcell(
        config_path: Option<&String>,
    ) -> Result<CowCell<ConfigFile>, std::io::Error> {
        Ok(CowCell::new(ConfigFile::try_from(config_path)?))
    }

    /// Loads the configuration from a given file or from some default locations.
    ///
    /// The default locations are `~/.config/stubns.json` and `./stubns.json`.
    pub fn try_from(config_path: Option<&String>) -> Result<ConfigFile, std::io::Error> {
        let file_locations = match config_path {
            Some(value) => vec![value.to_owned()],
            None => CONFIG_LOCATIONS.iter().map(|x| x.to_string()).collect(),
        };

        // clean up the file paths and filter them by the ones that exist
        let found_files: Vec<String> = file_locations
            .iter()
            .filter_map(|f| {
                let path = shellexpand::tilde(&f).into_owned();
                let filepath = std::path::Path::new(&path);
                match filepath.exists() {
                    false => {
                        eprintln!("Config file {path} doesn't exist, skipping.");
                        None
                    }
                    true => Some(path),
                }
            })
            .collect();

        if config_path.is_some() && found_files.is_empty() {
            return Err(std::io::Error::new(
                ErrorKind::NotFound,
                "No configuration files found",
            ));
        }

        for filepath in found_files {
            let builder = Config::builder()
                .add_source(File::new(&filepath, config::FileFormat::Json))
                .add_source(config::Environment::with_prefix("stubns"));

            match builder.build() {
                Ok(config) => {
                    eprintln!("Successfully loaded config from: {filepath}");
                    return Ok(ConfigFile::from(config));
                }
                Err(error) => eprintln!("Couldn't load config from {filepath}: {error:?}"),
            }
        }

        Ok(ConfigFile::default())
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            stub_listener: StubListenerMode::Yes,
            stub_address: DNS_STUB_ADDRESS.to_string(),
            stub_port: DNS_STUB_PORT,
            extra_listeners: vec![],
            upstream: None,
            log_level: "info".to_string(),
        }
    }
}

impl Display for ConfigFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let extra = match self.extra_listeners.is_empty() {
            true => "none".to_string(),
            false => self
                .extra_listeners
                .iter()
                .map(|l| l.to_string())
                .collect::<Vec<String>>()
                .join(", "),
        };
        f.write_fmt(format_args!(
            "stub_listener={} stub_address=\"{}:{}\" extra_listeners=[{}] upstream={:?} log_level={}",
            self.stub_listener, self.stub_address, self.stub_port, extra, self.upstream, self.log_level
        ))
    }
}

impl From<Config> for ConfigFile {
    fn from(config: Config) -> Self {
        ConfigFile {
            stub_listener: config
                .get("stub_listener")
                .unwrap_or(Self::default().stub_listener),
            stub_address: config
                .get("stub_address")
                .unwrap_or(Self::default().stub_address),
            stub_port: config.get("stub_port").unwrap_or(Self::default().stub_port),
            extra_listeners: config
                .get("extra_listeners")
                .unwrap_or(Self::default().extra_listeners),
            upstream: config.get("upstream").unwrap_or(Self::default().upstream),
            log_level: config.get("log_level").unwrap_or(Self::default().log_level),
        }
    }
}

impl FromStr for ConfigFile {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let configfile = File::from_str(input, config::FileFormat::Json);

        let res = Config::builder()
            .add_source(configfile)
            .build()
            .map_err(|e| format!("{e:?}"))?;

        Ok(res.into())
    }
}

const CONFIG_LOCATIONS: &[&str] = &["./stubns.json", "~/.config/stubns.json"];
