use crate::connection::pool::ConnectionPool;
use crate::core::{ProxyError, Result};
use crc::{CRC_64_XZ, Crc};
use std::fmt;

const KEYSPACE_CRC: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

/// Hash a routing key into the 64-bit keyspace.
///
/// CRC-64 with the ECMA-182 polynomial in its reflected form, the same
/// checksum produced by Go's `crc64.Checksum(.., crc64.MakeTable(crc64.ECMA))`,
/// so placements stay stable across implementations.
pub fn keyspace_id(key: &str) -> u64 {
    KEYSPACE_CRC.checksum(key.as_bytes())
}

/// Placement of one shard before its pool is opened
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    pub host: String,
    pub name: String,
    pub keyspace_start: u64,
    /// Exclusive, except for the last shard where it is `u64::MAX` inclusive
    pub keyspace_end: u64,
    pub is_last: bool,
}

impl ShardSpec {
    pub fn owns(&self, id: u64) -> bool {
        id >= self.keyspace_start
            && (id < self.keyspace_end || (self.is_last && id == self.keyspace_end))
    }
}

/// A shard with its connection pool
pub struct Shard {
    pub spec: ShardSpec,
    pub pool: ConnectionPool,
}

impl Shard {
    pub fn new(spec: ShardSpec, pool: ConnectionPool) -> Self {
        Self { spec, pool }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn host(&self) -> &str {
        &self.spec.host
    }

    pub fn owns(&self, id: u64) -> bool {
        self.spec.owns(id)
    }
}

impl fmt::Debug for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shard")
            .field("host", &self.spec.host)
            .field("name", &self.spec.name)
            .field("keyspace_start", &format_args!("{:#018x}", self.spec.keyspace_start))
            .field("keyspace_end", &format_args!("{:#018x}", self.spec.keyspace_end))
            .finish()
    }
}

/// Split the keyspace evenly across `hosts`
///
/// The host count must be a power of two and every entry `host:port`.
/// Shard `i` owns `[start, start + range + 1)`; the last shard runs up to
/// and including `u64::MAX`.
pub fn build_shards(keyspace: &str, hosts: &[String]) -> Result<Vec<ShardSpec>> {
    let count = hosts.len();
    if !count.is_power_of_two() {
        return Err(ProxyError::ShardCount(count));
    }

    for host in hosts {
        validate_host(host)?;
    }

    let shard_range = u64::MAX / count as u64;
    let digits = prefix_digits(count);
    let mut shards = Vec::with_capacity(count);
    let mut start = 0u64;

    for (i, host) in hosts.iter().enumerate() {
        let is_last = i == count - 1;
        let end = if is_last {
            start + shard_range
        } else {
            start + shard_range + 1
        };

        let name = match (i == 0, is_last) {
            (true, true) => format!("{}_$", keyspace),
            (true, false) => format!("{}_${}", keyspace, hex_prefix(end, digits)),
            (false, true) => format!("{}_{}$", keyspace, hex_prefix(start, digits)),
            (false, false) => format!(
                "{}_{}${}",
                keyspace,
                hex_prefix(start, digits),
                hex_prefix(end, digits)
            ),
        };

        shards.push(ShardSpec {
            host: host.clone(),
            name,
            keyspace_start: start,
            keyspace_end: end,
            is_last,
        });
        start = end;
    }

    Ok(shards)
}

fn validate_host(host: &str) -> Result<()> {
    let mut parts = host.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(port), None) if !name.is_empty() && port.parse::<u16>().is_ok() => {
            Ok(())
        }
        _ => Err(ProxyError::BadHost(host.to_string())),
    }
}

/// Hex digits needed to keep boundary prefixes unique, at least two.
fn prefix_digits(count: usize) -> usize {
    let bits = count.trailing_zeros() as usize;
    bits.div_ceil(4).max(2)
}

fn hex_prefix(value: u64, digits: usize) -> String {
    let mut hex = format!("{:016x}", value);
    hex.truncate(digits);
    hex
}
