use crate::error::F40Error;
use crate::layout::{BlockNumber, KeyFormat};
use std::str::FromStr;

/// How a volume is mounted.
///
/// Built either with the setters or parsed from a comma separated option
/// string such as `"ro,preload,diskmap=300"`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MountOptions {
    pub read_only: bool,
    /// Load and verify every bitmap group during mount instead of on first
    /// use.
    pub preload_bitmaps: bool,
    /// Disk map location overriding the one in the master super block.
    pub diskmap: Option<BlockNumber>,
    pub key_format: KeyFormat,
}

impl MountOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn preload_bitmaps(mut self, preload: bool) -> Self {
        self.preload_bitmaps = preload;
        self
    }

    pub fn diskmap(mut self, blocknr: BlockNumber) -> Self {
        self.diskmap = Some(blocknr);
        self
    }

    pub fn key_format(mut self, keys: KeyFormat) -> Self {
        self.key_format = keys;
        self
    }
}

impl FromStr for MountOptions {
    type Err = F40Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = MountOptions::default();
        for opt in s.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            let (name, value) = match opt.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (opt, None),
            };
            match (name, value) {
                ("ro", None) => options.read_only = true,
                ("rw", None) => options.read_only = false,
                ("preload", None) => options.preload_bitmaps = true,
                ("diskmap", Some(v)) => {
                    let blocknr = v.parse::<BlockNumber>().map_err(|_| {
                        F40Error::InvalidOption(format!("diskmap={} is not a block number", v))
                    })?;
                    options.diskmap = Some(blocknr);
                }
                ("keys", Some("large")) => options.key_format = KeyFormat::Large,
                ("keys", Some("short")) => options.key_format = KeyFormat::Short,
                _ => return Err(F40Error::InvalidOption(opt.to_string())),
            }
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_gives_defaults() {
        let options: MountOptions = "".parse().unwrap();
        assert_eq!(options, MountOptions::default());
        assert_eq!(options.key_format, KeyFormat::Large);
    }

    #[test]
    fn parses_every_option() {
        let options: MountOptions = "ro, preload,diskmap=300,keys=short".parse().unwrap();
        assert_eq!(
            options,
            MountOptions::new()
                .read_only(true)
                .preload_bitmaps(true)
                .diskmap(300)
                .key_format(KeyFormat::Short)
        );
    }

    #[test]
    fn later_options_win() {
        let options: MountOptions = "ro,rw".parse().unwrap();
        assert!(!options.read_only);
    }

    #[test]
    fn unknown_or_malformed_options_are_rejected() {
        for bad in ["noatime", "diskmap", "diskmap=x", "keys=medium", "ro=1"] {
            match bad.parse::<MountOptions>() {
                Err(F40Error::InvalidOption(_)) => (),
                other => panic!("{:?} parsed as {:?}", bad, other),
            }
        }
    }
}
