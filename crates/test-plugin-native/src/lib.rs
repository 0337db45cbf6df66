//! Native plugin fixture for end-to-end tests.
//!
//! Built once per variant by `plinth-test`:
//!
//! | Feature           | Behaviour                                                |
//! |-------------------|----------------------------------------------------------|
//! | `kind-inline`     | INLINE; writes `<name>.inline` and `<name>.cleanup`      |
//! | `kind-background` | BACKGROUND; stops on call `work_limit`, writes `.seen`   |
//! | `partial`         | exports only `plugin_init` and `plugin_cleanup`          |
//! | `reject`          | `plugin_init` returns 7                                  |
//!
//! Output files go to the `out_dir` key of the custom config. Recognised
//! keys: `"out_dir": "<path>"`, `"work_limit": <n>` (default 3).

#![cfg_attr(any(feature = "partial", feature = "reject"), allow(dead_code))]

#[cfg(not(any(
    feature = "kind-inline",
    feature = "kind-background",
    feature = "partial",
    feature = "reject"
)))]
compile_error!("enable one of: kind-inline, kind-background, partial, reject");

use std::path::PathBuf;

use plinth_abi::ConfigRecord;

/// Value of `"key": ...` in a flat JSON object, without quotes.
fn config_value<'a>(config: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("\"{key}\"");
    let rest = &config[config.find(&needle)? + needle.len()..];
    let rest = rest.trim_start().strip_prefix(':')?.trim_start();
    if let Some(quoted) = rest.strip_prefix('"') {
        return quoted.split('"').next();
    }
    let end = rest.find([',', '}']).unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn output_path(record: &ConfigRecord, suffix: &str) -> Option<PathBuf> {
    let config = record.custom_config();
    let dir = config_value(&config, "out_dir")?;
    Some(PathBuf::from(dir).join(format!("{}.{suffix}", record.plugin_name())))
}

fn write_output(record: &ConfigRecord, suffix: &str, contents: &str) {
    if let Some(path) = output_path(record, suffix) {
        let _ = std::fs::write(path, contents);
    }
}

fn describe(record: &ConfigRecord) -> String {
    format!(
        "{}\n{}\n{}\n{}\n",
        record.plugin_name(),
        record.plugin_path(),
        record.custom_config(),
        record.owner_pid()
    )
}

#[cfg(feature = "kind-inline")]
mod variant {
    use plinth_abi::{ConfigRecord, Plugin, PluginKind, WorkStatus, plinth_plugin};

    use super::{describe, write_output};

    struct InlineFixture {
        out: Option<ConfigRecord>,
    }

    impl Plugin for InlineFixture {
        const KIND: PluginKind = PluginKind::Inline;

        fn init() -> Result<Self, i32> {
            Ok(Self { out: None })
        }

        fn work(&mut self, record: Option<&ConfigRecord>) -> WorkStatus {
            if let Some(record) = record {
                write_output(record, "inline", &describe(record));
                self.out = Some(record.clone());
            }
            WorkStatus::Stop(1)
        }

        fn cleanup(self) {
            if let Some(record) = &self.out {
                write_output(record, "cleanup", "cleanup\n");
            }
        }
    }

    plinth_plugin!(InlineFixture);
}

#[cfg(feature = "kind-background")]
mod variant {
    use plinth_abi::{ConfigRecord, Plugin, PluginKind, WorkStatus, plinth_plugin};

    use super::{config_value, describe, write_output};

    struct BackgroundFixture {
        calls: u32,
        limit: Option<u32>,
    }

    impl Plugin for BackgroundFixture {
        const KIND: PluginKind = PluginKind::Background;

        fn init() -> Result<Self, i32> {
            Ok(Self {
                calls: 0,
                limit: None,
            })
        }

        fn work(&mut self, record: Option<&ConfigRecord>) -> WorkStatus {
            let Some(record) = record else {
                return WorkStatus::Stop(2);
            };
            let limit = *self.limit.get_or_insert_with(|| {
                write_output(record, "seen", &describe(record));
                config_value(&record.custom_config(), "work_limit")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(3)
            });

            self.calls = self.calls.saturating_add(1);
            std::thread::sleep(std::time::Duration::from_millis(10));
            if self.calls >= limit {
                write_output(record, "count", &format!("{}\n", self.calls));
                WorkStatus::Stop(1)
            } else {
                WorkStatus::Continue
            }
        }
    }

    plinth_plugin!(BackgroundFixture);
}

#[cfg(feature = "reject")]
mod variant {
    use plinth_abi::{ConfigRecord, Plugin, PluginKind, WorkStatus, plinth_plugin};

    struct Rejecting;

    impl Plugin for Rejecting {
        const KIND: PluginKind = PluginKind::Inline;

        fn init() -> Result<Self, i32> {
            Err(7)
        }

        fn work(&mut self, _record: Option<&ConfigRecord>) -> WorkStatus {
            WorkStatus::Stop(1)
        }
    }

    plinth_plugin!(Rejecting);
}

#[cfg(feature = "partial")]
mod variant {
    #[unsafe(no_mangle)]
    pub extern "C" fn plugin_init() -> std::ffi::c_int {
        0
    }

    #[unsafe(no_mangle)]
    pub extern "C" fn plugin_cleanup() {}
}

#[cfg(test)]
mod tests {
    use super::config_value;

    #[test]
    fn test_config_value() {
        let cfg = r#"{"out_dir": "/tmp/x", "work_limit": 5}"#;
        assert_eq!(config_value(cfg, "out_dir"), Some("/tmp/x"));
        assert_eq!(config_value(cfg, "work_limit"), Some("5"));
        assert_eq!(config_value(cfg, "missing"), None);
    }
}
