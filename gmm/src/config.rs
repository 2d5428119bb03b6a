// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Allocator configuration and its `key=value` string parser.

use alloc::string::String;

use log::error;
use logos::Logos;

use crate::error::{GmmError, GmmResult};

/// Definition to parse the configuration string.
#[derive(Logos, Debug, PartialEq, Clone, Copy)]
enum ConfigToken {
    /// Global page budget
    #[token("max_pages")]
    MaxPages,

    /// Bind chunks to the VM that created them
    #[token("bound")]
    Bound,

    /// Checksum shared pages
    #[token("strict")]
    Strict,

    /// Audit the books on every call
    #[token("sanity")]
    Sanity,

    #[token("sharing")]
    Sharing,

    #[token("ballooning")]
    Ballooning,

    /// Log filter
    #[token("log")]
    Log,

    #[regex("[a-zA-Z0-9\\._:-]+")]
    Ident,

    #[token("=", priority = 22)]
    KVSeparator,

    #[regex(r#"'[^']*'"#)]
    LiteralString,

    /// Anything not properly encoded
    #[error]
    #[regex(r"[ \t\n]+", logos::skip)]
    Error,
}

impl ConfigToken {
    fn is_key(&self) -> bool {
        !matches!(
            self,
            ConfigToken::Ident
                | ConfigToken::KVSeparator
                | ConfigToken::LiteralString
                | ConfigToken::Error
        )
    }
}

/// Knobs of the allocator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GmmConfig {
    /// Global page budget.
    pub max_pages: u64,
    /// Bound memory mode: a chunk only ever holds pages of the VM that
    /// caused its allocation.
    pub bound: bool,
    /// Keep CRC-32 checksums of shared pages and verify them on merge and
    /// on release.
    pub strict: bool,
    /// Audit all counters on entry and exit of every mutating call.
    pub sanity: bool,
    /// Page sharing default for new VMs.
    pub sharing: bool,
    /// Ballooning default for new VMs.
    pub ballooning: bool,
    /// Log filter the embedding layer may hand to its logger.
    pub log_filter: String,
}

impl Default for GmmConfig {
    fn default() -> Self {
        Self {
            max_pages: u32::MAX as u64,
            bound: false,
            strict: false,
            sanity: cfg!(debug_assertions),
            sharing: true,
            ballooning: true,
            log_filter: String::from("info"),
        }
    }
}

fn parse_bool(value: &str) -> GmmResult<bool> {
    match value {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(GmmError::InvalidParameter),
    }
}

fn parse_u64(value: &str) -> GmmResult<u64> {
    let parsed = match value.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed.map_err(|_e| GmmError::InvalidParameter)
}

impl GmmConfig {
    fn set(&mut self, key: ConfigToken, value: &str) -> GmmResult<()> {
        match key {
            ConfigToken::MaxPages => self.max_pages = parse_u64(value)?,
            ConfigToken::Bound => self.bound = parse_bool(value)?,
            ConfigToken::Strict => self.strict = parse_bool(value)?,
            ConfigToken::Sanity => self.sanity = parse_bool(value)?,
            ConfigToken::Sharing => self.sharing = parse_bool(value)?,
            ConfigToken::Ballooning => self.ballooning = parse_bool(value)?,
            ConfigToken::Log => self.log_filter = String::from(value),
            _ => return Err(GmmError::InvalidParameter),
        }
        Ok(())
    }

    /// Parse a configuration string.
    ///
    /// Example: `max_pages=4096 bound=on log='gmm=trace'`. Keys not given
    /// keep their default.
    pub fn from_str(args: &str) -> GmmResult<Self> {
        let mut config: GmmConfig = Default::default();
        let mut lexer = ConfigToken::lexer(args);
        let mut key = ConfigToken::Error;
        let mut prev = ConfigToken::Error;

        while let Some(token) = lexer.next() {
            let slice = lexer.slice();

            match token {
                // A key name in value position is just a value.
                t if t.is_key() && prev != ConfigToken::KVSeparator => {
                    if key != ConfigToken::Error {
                        error!("Malformed config `{}`: no value for {:?}", args, key);
                        return Err(GmmError::InvalidParameter);
                    }
                    key = token;
                }
                ConfigToken::KVSeparator => {
                    if !prev.is_key() || prev != key {
                        error!(
                            "Malformed config (unexpected equal sign) in `{}` previous token was {:?}",
                            args, prev
                        );
                        return Err(GmmError::InvalidParameter);
                    }
                }
                ConfigToken::LiteralString if prev == ConfigToken::KVSeparator => {
                    // We strip the quotes with 1..slice.len()-1
                    config.set(key, &slice[1..slice.len() - 1])?;
                    key = ConfigToken::Error;
                }
                _ if prev == ConfigToken::KVSeparator && token != ConfigToken::Error => {
                    config.set(key, slice)?;
                    key = ConfigToken::Error;
                }
                ConfigToken::Error => {
                    error!(
                        "Malformed config! Encountered '{}' while parsing: {}",
                        slice, args
                    );
                    return Err(GmmError::InvalidParameter);
                }
                _ => {
                    error!("Invalid config: {} (unknown key {})", args, slice);
                    return Err(GmmError::InvalidParameter);
                }
            }
            prev = token;
        }

        if key != ConfigToken::Error {
            error!("Malformed config `{}`: no value for {:?}", args, key);
            return Err(GmmError::InvalidParameter);
        }

        Ok(config)
    }
}
