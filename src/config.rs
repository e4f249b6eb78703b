use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::allocator::AddressRange;
use crate::error::{Error, Result};

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Raw lease engine configuration, as written in `config.json` or passed as
/// positional arguments. Call [`Config::validate`] to obtain [`PoolSettings`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub leases_file: String,
    pub range_start: String,
    pub range_end: String,
    pub lease_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_addresses: Option<String>,
}

/// Validated configuration. Built once at startup and never re-read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub leases_file: PathBuf,
    pub range: AddressRange,
    pub lease_time: Duration,
    pub excluded: Vec<Ipv4Addr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            leases_file: "leases.json".to_string(),
            range_start: "192.168.1.100".to_string(),
            range_end: "192.168.1.200".to_string(),
            lease_time: "24h".to_string(),
            excluded_addresses: None,
        }
    }
}

impl Config {
    /// Builds a configuration from positional arguments:
    /// `<leases file> <range start> <range end> <lease time> [excluded,addresses]`.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        if args.len() < 4 {
            return Err(Error::InvalidConfig(format!(
                "invalid number of arguments, want: 4 (file name, start IP, end IP, lease time), got: {}",
                args.len()
            )));
        }

        Ok(Self {
            leases_file: args[0].as_ref().to_string(),
            range_start: args[1].as_ref().to_string(),
            range_end: args[2].as_ref().to_string(),
            lease_time: args[3].as_ref().to_string(),
            excluded_addresses: args.get(4).map(|list| list.as_ref().to_string()),
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            Self::load(path)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<PoolSettings> {
        if self.leases_file.trim().is_empty() {
            return Err(Error::InvalidConfig("file name cannot be empty".to_string()));
        }

        let start = parse_ipv4(&self.range_start, "invalid IPv4 address")?;
        let end = parse_ipv4(&self.range_end, "invalid IPv4 address")?;
        let range = AddressRange::new(start, end)?;

        let lease_time = parse_duration(&self.lease_time).ok_or_else(|| {
            Error::InvalidConfig(format!("invalid lease duration: {}", self.lease_time))
        })?;
        if lease_time.is_zero() {
            return Err(Error::InvalidConfig(
                "lease duration must be greater than 0".to_string(),
            ));
        }
        if round_to_seconds(lease_time) > u64::from(u32::MAX) {
            return Err(Error::InvalidConfig(format!(
                "lease duration {} does not fit the lease time option",
                self.lease_time
            )));
        }

        let mut excluded = Vec::new();
        if let Some(list) = self.excluded_addresses.as_deref()
            && !list.trim().is_empty()
        {
            for entry in list.split(',') {
                let ip = parse_ipv4(entry, "invalid excluded IP address")?;
                if !range.contains(ip) {
                    return Err(Error::InvalidConfig(format!(
                        "excluded IP {} is not in the range {}",
                        ip, range
                    )));
                }
                excluded.push(ip);
            }
        }

        Ok(PoolSettings {
            leases_file: PathBuf::from(&self.leases_file),
            range,
            lease_time,
            excluded,
        })
    }
}

impl PoolSettings {
    /// The configured lease time rounded to whole seconds, as announced to
    /// clients.
    pub fn lease_time_seconds(&self) -> u32 {
        u32::try_from(round_to_seconds(self.lease_time)).unwrap_or(u32::MAX)
    }
}

fn parse_ipv4(value: &str, context: &str) -> Result<Ipv4Addr> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{}: {}", context, value)))
}

/// Rounds half away from zero, like the lease time option encoding expects.
pub(crate) fn round_to_seconds(duration: Duration) -> u64 {
    let seconds = duration.as_secs();
    if duration.subsec_nanos() >= 500_000_000 {
        seconds + 1
    } else {
        seconds
    }
}

/// Parses a duration such as `1h`, `90m`, `1h30m`, `1.5h` or `250ms`.
///
/// Accepted units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. Every
/// number needs a unit, except a bare `0`. A leading `+` is allowed.
///
/// Unlike Go's `time.ParseDuration`, a leading `-` is always rejected since
/// [`Duration`] cannot be negative. This function accepts zero, but
/// [`Config::validate`] refuses a zero lease time.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    let input = input.strip_prefix('+').unwrap_or(input);
    if input == "0" {
        return Some(Duration::ZERO);
    }
    if input.is_empty() {
        return None;
    }

    let mut rest = input;
    let mut total: u128 = 0;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => NANOS_PER_SECOND,
            "m" => 60 * NANOS_PER_SECOND,
            "h" => 3600 * NANOS_PER_SECOND,
            _ => return None,
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return None;
        }

        let whole: u128 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
        let mut nanos = whole.checked_mul(unit_nanos)?;
        let mut scale = unit_nanos;
        for digit in fraction.chars() {
            scale /= 10;
            nanos += u128::from(digit.to_digit(10)?) * scale;
        }

        total = total.checked_add(nanos)?;
        rest = tail;
    }

    let seconds = u64::try_from(total / NANOS_PER_SECOND).ok()?;
    Some(Duration::new(seconds, (total % NANOS_PER_SECOND) as u32))
}
