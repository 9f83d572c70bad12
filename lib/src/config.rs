// Copyright 2024 The Revfs Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-repository tuning knobs, read from the `fsfs.conf` INI file.

use std::path::Path;

use ini::Ini;
use thiserror::Error;

use crate::file_util::PathError;

/// Default shard size for new repositories.
pub const DEFAULT_SHARD_SIZE: u64 = 1000;
/// Default cap on the number of predecessors a skip-delta base walk may
/// visit before deltification is abandoned.
pub const DEFAULT_MAX_DELTIFICATION_WALK: u64 = 1023;
/// Default length of the linear prefix of a delta chain.
pub const DEFAULT_MAX_LINEAR_DELTIFICATION: u64 = 16;
/// Default uncompressed revprop pack size, in kilobytes.
pub const DEFAULT_REVPROP_PACK_SIZE_KB: u64 = 64;
/// Default compressed revprop pack size, in kilobytes.
pub const DEFAULT_COMPRESSED_REVPROP_PACK_SIZE_KB: u64 = 256;

/// Error reading or interpreting `fsfs.conf`.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error(transparent)]
    Read(#[from] PathError),
    /// The file is not valid INI.
    #[error("Malformed fsfs.conf: {0}")]
    Malformed(String),
    /// A recognized key has an uninterpretable value.
    #[error("Invalid value {value:?} for fsfs.conf key {key}")]
    BadValue {
        /// The key.
        key: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Parsed `fsfs.conf` contents. Unknown sections and keys are ignored.
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// `[rep-sharing] enable-rep-sharing`.
    pub enable_rep_sharing: bool,
    /// `[deltification] enable-dir-deltification`.
    pub deltify_directories: bool,
    /// `[deltification] enable-props-deltification`.
    pub deltify_properties: bool,
    /// `[deltification] max-deltification-walk`; 0 disables deltification.
    pub max_deltification_walk: u64,
    /// `[deltification] max-linear-deltification`; values <= 1 force pure
    /// skip-delta.
    pub max_linear_deltification: u64,
    /// `[packed-revprops] revprop-pack-size`, kilobytes.
    pub revprop_pack_size_kb: u64,
    /// `[packed-revprops] compress-packed-revprops`.
    pub compress_packed_revprops: bool,
    /// `[caches] fail-stop`.
    pub cache_fail_stop: bool,
    /// `[memcached-servers]` entries, carried opaquely as `name = host:port`.
    pub memcached_servers: Vec<(String, String)>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            enable_rep_sharing: true,
            deltify_directories: false,
            deltify_properties: false,
            max_deltification_walk: DEFAULT_MAX_DELTIFICATION_WALK,
            max_linear_deltification: DEFAULT_MAX_LINEAR_DELTIFICATION,
            revprop_pack_size_kb: DEFAULT_REVPROP_PACK_SIZE_KB,
            compress_packed_revprops: false,
            cache_fail_stop: false,
            memcached_servers: vec![],
        }
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::BadValue {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_u64(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::BadValue {
        key,
        value: value.to_string(),
    })
}

impl FsConfig {
    /// Loads `fsfs.conf` from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(ConfigError::Read(PathError {
                    path: path.to_path_buf(),
                    source: err,
                }));
            }
        };
        Self::parse(&text)
    }

    /// Parses configuration text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|err| ConfigError::Malformed(err.to_string()))?;
        let mut config = Self::default();

        if let Some(section) = ini.section(Some("rep-sharing")) {
            if let Some(value) = section.get("enable-rep-sharing") {
                config.enable_rep_sharing = parse_bool("enable-rep-sharing", value)?;
            }
        }
        if let Some(section) = ini.section(Some("deltification")) {
            if let Some(value) = section.get("enable-dir-deltification") {
                config.deltify_directories = parse_bool("enable-dir-deltification", value)?;
            }
            if let Some(value) = section.get("enable-props-deltification") {
                config.deltify_properties = parse_bool("enable-props-deltification", value)?;
            }
            if let Some(value) = section.get("max-deltification-walk") {
                config.max_deltification_walk = parse_u64("max-deltification-walk", value)?;
            }
            if let Some(value) = section.get("max-linear-deltification") {
                config.max_linear_deltification = parse_u64("max-linear-deltification", value)?;
            }
        }
        if let Some(section) = ini.section(Some("packed-revprops")) {
            if let Some(value) = section.get("revprop-pack-size") {
                config.revprop_pack_size_kb = parse_u64("revprop-pack-size", value)?;
            }
            if let Some(value) = section.get("compress-packed-revprops") {
                config.compress_packed_revprops = parse_bool("compress-packed-revprops", value)?;
                if config.compress_packed_revprops
                    && config.revprop_pack_size_kb == DEFAULT_REVPROP_PACK_SIZE_KB
                {
                    config.revprop_pack_size_kb = DEFAULT_COMPRESSED_REVPROP_PACK_SIZE_KB;
                }
            }
        }
        if let Some(section) = ini.section(Some("caches")) {
            if let Some(value) = section.get("fail-stop") {
                config.cache_fail_stop = parse_bool("fail-stop", value)?;
            }
        }
        if let Some(section) = ini.section(Some("memcached-servers")) {
            for (name, value) in section.iter() {
                config
                    .memcached_servers
                    .push((name.to_string(), value.to_string()));
            }
        }
        Ok(config)
    }

    /// The default configuration file written into new repositories.
    pub fn default_file_contents() -> &'static str {
        "\
### Tuning options for the filesystem at this repository path.

[rep-sharing]
### Share identical file contents between revisions, keyed by SHA-1.
# enable-rep-sharing = true

[deltification]
### Store directory listings as deltas against earlier revisions.
# enable-dir-deltification = false
### Store property lists as deltas against earlier revisions.
# enable-props-deltification = false
### Longest predecessor walk attempted when picking a delta base;
### 0 disables deltification entirely.
# max-deltification-walk = 1023
### Length of the linear section at the head of a delta chain.
# max-linear-deltification = 16

[packed-revprops]
### Size, in kilobytes, of a revision property pack group.
# revprop-pack-size = 64
# compress-packed-revprops = false

[caches]
### Turn cache errors into fatal errors instead of warnings.
# fail-stop = false
"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = FsConfig::default();
        assert!(config.enable_rep_sharing);
        assert!(!config.deltify_directories);
        assert_eq!(config.max_deltification_walk, 1023);
        assert_eq!(config.max_linear_deltification, 16);
    }

    #[test]
    fn parses_recognized_sections() {
        let config = FsConfig::parse(
            "[rep-sharing]\nenable-rep-sharing = false\n\
             [deltification]\nmax-linear-deltification = 4\n\
             [memcached-servers]\nlocal = 127.0.0.1:11211\n",
        )
        .unwrap();
        assert!(!config.enable_rep_sharing);
        assert_eq!(config.max_linear_deltification, 4);
        assert_eq!(
            config.memcached_servers,
            vec![("local".to_string(), "127.0.0.1:11211".to_string())]
        );
    }

    #[test]
    fn default_file_parses_back_to_defaults() {
        let config = FsConfig::parse(FsConfig::default_file_contents()).unwrap();
        assert!(config.enable_rep_sharing);
        assert_eq!(config.max_deltification_walk, 1023);
    }

    #[test]
    fn rejects_bad_values() {
        assert_matches::assert_matches!(
            FsConfig::parse("[deltification]\nmax-deltification-walk = many\n"),
            Err(ConfigError::BadValue { .. })
        );
    }
}
