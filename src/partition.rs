//! Partition names, image sources and the IMAGE_LIST announcement

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::protocol::MAX_PART_NAME;
use crate::upload::crc32;
use crate::ConfigError;

/// Validated partition name, 1 to 30 ASCII bytes
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PartitionName(String);

impl PartitionName {
    pub fn new(name: &str) -> Result<Self, ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::EmptyName);
        }
        if name.len() > MAX_PART_NAME {
            return Err(ConfigError::NameTooLong(name.to_string()));
        }
        // Names are comma separated in IMAGE_LIST and NUL padded in START_DATA
        if !name.is_ascii() || name.contains(',') || name.contains('\0') {
            return Err(ConfigError::InvalidName(name.to_string()));
        }

        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fixed width, zero padded wire field
    pub fn to_field(&self) -> [u8; MAX_PART_NAME] {
        let mut field = [0u8; MAX_PART_NAME];
        field[..self.0.len()].copy_from_slice(self.0.as_bytes());
        field
    }
}

impl FromStr for PartitionName {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where partition contents come from
#[derive(Clone, PartialEq, Debug)]
pub enum ImageSource {
    File(PathBuf),
    Buffer(Vec<u8>),
}

impl ImageSource {
    /// Read the image contents, files are read on demand
    pub fn load(&self) -> std::io::Result<Cow<'_, [u8]>> {
        match self {
            ImageSource::File(p) => std::fs::read(p).map(Cow::Owned),
            ImageSource::Buffer(b) => Ok(Cow::Borrowed(b.as_slice())),
        }
    }
}

/// A partition to upload
#[derive(Clone, PartialEq, Debug)]
pub struct PartitionSpec {
    pub name: PartitionName,
    pub source: ImageSource,
    /// Target address, 0 lets the device place the partition
    pub addr: u32,
}

impl PartitionSpec {
    pub fn file<P: Into<PathBuf>>(name: &str, path: P) -> Result<Self, ConfigError> {
        Ok(Self {
            name: PartitionName::new(name)?,
            source: ImageSource::File(path.into()),
            addr: 0,
        })
    }

    pub fn buffer(name: &str, data: Vec<u8>) -> Result<Self, ConfigError> {
        Ok(Self {
            name: PartitionName::new(name)?,
            source: ImageSource::Buffer(data),
            addr: 0,
        })
    }

    pub fn with_addr(mut self, addr: u32) -> Self {
        self.addr = addr;
        self
    }
}

/// Parse a `<name>:<file>` pair, splitting at the first colon
impl FromStr for PartitionSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((name, file)) if !file.is_empty() => Self::file(name, file),
            _ => Err(ConfigError::MalformedPartition(s.to_string())),
        }
    }
}

/// Comma separated partition names, in upload order
pub fn image_list(names: &[&PartitionName]) -> Vec<u8> {
    let names: Vec<_> = names.iter().map(|n| n.as_str()).collect();
    names.join(",").into_bytes()
}

/// IMAGE_LIST payload: `0 || crc32(list) || list`
pub fn image_list_payload(names: &[&PartitionName]) -> Vec<u8> {
    let list = image_list(names);

    let mut buf = Vec::with_capacity(8 + list.len());
    buf.extend_from_slice(&0u32.to_le_bytes());
    buf.extend_from_slice(&crc32(&list).to_le_bytes());
    buf.extend_from_slice(&list);
    buf
}
