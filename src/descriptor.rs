//! Descriptor lexer/parser (`spec.md` §4.B): turns the embedded or sidecar
//! textual descriptor into a typed [`ImageModel`].
//!
//! The tokenizer and regexes are carried over from the teacher crate's
//! `vmdk.rs` (`VMDKDescriptorFile::from_str`, `parse_key_value_pair`,
//! `EXTENT_DESCRIPTOR_REGEX`), generalized to the richer `ExtentSpec`/
//! `ImageModel` shape this crate's read coordinator needs.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;

use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Error;

const SIGNATURE_HEADER: &str = "# Disk DescriptorFile";
const SIGNATURE_EXTENT: &str = "# Extent description";
const SIGNATURE_CHANGE_TRACKING: &str = "# Change Tracking File";
const SIGNATURE_DDB: &str = "# The Disk Data Base";

pub const SECTOR_SIZE: u64 = 512;

/// Disk type, with the integer codes from `spec.md` §6 preserved for
/// compatibility via [`DiskType::as_code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskType {
    Unknown,
    TwoGbExtentFlat,
    TwoGbExtentSparse,
    Custom,
    Device,
    DevicePartitioned,
    MonolithicFlat,
    MonolithicSparse,
    StreamOptimized,
    VmfsFlat,
    VmfsFlatPreallocated,
    VmfsFlatZeroed,
    VmfsRaw,
    VmfsRdm,
    VmfsRdmp,
    VmfsSparse,
    VmfsSparseThin,
    VmfsSparse2Gb,
}

impl DiskType {
    /// The integer code listed in `spec.md` §6, preserved for compatibility.
    pub fn as_code(self) -> u8 {
        match self {
            DiskType::Unknown => 0,
            DiskType::TwoGbExtentFlat => 1,
            DiskType::TwoGbExtentSparse => 2,
            DiskType::Custom => 3,
            DiskType::Device => 4,
            DiskType::DevicePartitioned => 5,
            DiskType::MonolithicFlat => 6,
            DiskType::MonolithicSparse => 7,
            DiskType::StreamOptimized => 8,
            DiskType::VmfsFlat => 9,
            DiskType::VmfsFlatPreallocated => 10,
            DiskType::VmfsFlatZeroed => 11,
            DiskType::VmfsRaw => 12,
            DiskType::VmfsRdm => 13,
            DiskType::VmfsRdmp => 14,
            DiskType::VmfsSparse => 15,
            DiskType::VmfsSparseThin => 16,
            DiskType::VmfsSparse2Gb => 17,
        }
    }
}

impl FromStr for DiskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "2GbMaxExtentFlat" | "twoGbMaxExtentFlat" => DiskType::TwoGbExtentFlat,
            "2GbMaxExtentSparse" | "twoGbMaxExtentSparse" => DiskType::TwoGbExtentSparse,
            "custom" | "Custom" => DiskType::Custom,
            "fullDevice" => DiskType::Device,
            "partitionedDevice" => DiskType::DevicePartitioned,
            "monolithicFlat" => DiskType::MonolithicFlat,
            "monolithicSparse" => DiskType::MonolithicSparse,
            "streamOptimized" => DiskType::StreamOptimized,
            "vmfs" => DiskType::VmfsFlat,
            "vmfsPreallocated" => DiskType::VmfsFlatPreallocated,
            "vmfsEagerZeroedThick" => DiskType::VmfsFlatZeroed,
            "vmfsRaw" => DiskType::VmfsRaw,
            "vmfsRDM" => DiskType::VmfsRdm,
            "vmfsRDMP" => DiskType::VmfsRdmp,
            "vmfsSparse" => DiskType::VmfsSparse,
            "vmfsThin" => DiskType::VmfsSparseThin,
            "2GbMaxExtentSparseVmfs" => DiskType::VmfsSparse2Gb,
            other => {
                return Err(Error::input(format!("unknown createType: {}", other)));
            }
        })
    }
}

/// Access mode for an extent (`spec.md` §3 `ExtentSpec::access_mode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentAccessMode {
    NoAccess,
    ReadOnly,
    ReadWrite,
}

impl FromStr for ExtentAccessMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NOACCESS" => ExtentAccessMode::NoAccess,
            "RDONLY" => ExtentAccessMode::ReadOnly,
            "RW" => ExtentAccessMode::ReadWrite,
            other => {
                return Err(Error::input(format!("invalid extent access mode: {}", other)));
            }
        })
    }
}

/// Extent storage kind (`spec.md` §3 `ExtentSpec::storage_kind`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentKind {
    Flat,
    Sparse,
    Zero,
    Vmfs,
    VmfsSparse,
    VmfsRdm,
    VmfsRaw,
}

impl FromStr for ExtentKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "FLAT" => ExtentKind::Flat,
            "SPARSE" => ExtentKind::Sparse,
            "ZERO" => ExtentKind::Zero,
            "VMFS" => ExtentKind::Vmfs,
            "VMFSSPARSE" => ExtentKind::VmfsSparse,
            "VMFSRDM" => ExtentKind::VmfsRdm,
            "VMFSRAW" => ExtentKind::VmfsRaw,
            other => {
                return Err(Error::input(format!("invalid extent type: {}", other)));
            }
        })
    }
}

impl ExtentKind {
    pub fn is_sparse(self) -> bool {
        matches!(self, ExtentKind::Sparse | ExtentKind::VmfsSparse)
    }
}

/// One extent entry from the descriptor's `# Extent description` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtentSpec {
    pub access_mode: ExtentAccessMode,
    pub nominal_size_sectors: u64,
    pub storage_kind: ExtentKind,
    pub filename: Option<String>,
    pub start_offset_sectors: u64,
}

impl ExtentSpec {
    pub fn nominal_size_bytes(&self) -> u64 {
        self.nominal_size_sectors * SECTOR_SIZE
    }
}

static EXTENT_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(\w+)\s+(\d+)\s+(\w+)\s*"?([\w\-./ ]+)?"?\s*(\d+)?$"#).unwrap()
});

impl FromStr for ExtentSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Extent line grammar (spec.md §4.B):
        //   MODE SIZE_SECTORS KIND FILENAME [START_SECTORS]
        let captures = EXTENT_LINE_REGEX
            .captures(s)
            .ok_or_else(|| Error::input(format!("invalid extent description: {}", s)))?;
        let access_mode = captures.get(1).unwrap().as_str().parse()?;
        let nominal_size_sectors = captures
            .get(2)
            .unwrap()
            .as_str()
            .parse()
            .map_err(|_| Error::input("invalid extent size in sector count"))?;
        let storage_kind = captures.get(3).unwrap().as_str().parse()?;
        let filename = captures.get(4).map(|m| m.as_str().to_string());
        let start_offset_sectors = captures
            .get(5)
            .map(|m| match m.as_str().parse::<u64>() {
                Ok(n) => n,
                Err(_) => {
                    warn!("invalid extent start sector, defaulting to 0: {}", m.as_str());
                    0
                }
            })
            .unwrap_or(0);
        Ok(ExtentSpec {
            access_mode,
            nominal_size_sectors,
            storage_kind,
            filename,
            start_offset_sectors,
        })
    }
}

/// The parsed descriptor (`spec.md` §3 `ImageModel`), immutable after open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageModel {
    pub content_identifier: u32,
    pub parent_content_identifier: u32,
    pub disk_type: DiskType,
    pub parent_filename: Option<String>,
    pub extents: Vec<ExtentSpec>,
    pub encoding: Option<String>,
}

impl ImageModel {
    pub fn has_parent(&self) -> bool {
        self.parent_content_identifier != 0xffff_ffff
    }
}

fn section_header(line: &str) -> Option<&'static str> {
    if !line.starts_with('#') {
        return None;
    }
    match line {
        SIGNATURE_HEADER => Some("header"),
        SIGNATURE_EXTENT => Some("extent"),
        SIGNATURE_DDB => Some("ddb"),
        SIGNATURE_CHANGE_TRACKING => Some("change_tracking"),
        _ => None,
    }
}

static KEY_VALUE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^([\w.]+)\s*=\s*"?([^"]*)"?$"#).unwrap());

fn parse_key_value(line: &str) -> Option<(&str, &str)> {
    let captures = KEY_VALUE_REGEX.captures(line)?;
    Some((
        captures.get(1).unwrap().as_str(),
        captures.get(2).unwrap().as_str(),
    ))
}

const RECOGNIZED_HEADER_KEYS: &[&str] = &[
    "version",
    "encoding",
    "CID",
    "parentCID",
    "createType",
    "parentFileNameHint",
];

const RECOGNIZED_DDB_KEYS: &[&str] = &[
    "ddb.adapterType",
    "ddb.geometry.cylinders",
    "ddb.geometry.heads",
    "ddb.geometry.sectors",
];

/// Parses a complete descriptor body (`spec.md` §4.B).
pub fn parse(text: &str) -> Result<ImageModel, Error> {
    let mut current_section = "";
    let mut header: HashMap<String, String> = HashMap::new();
    let mut extents = Vec::new();

    for (lineno, raw_line) in text.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('#') {
            current_section = section_header(line).unwrap_or(current_section);
            continue;
        }
        match current_section {
            "header" => {
                if let Some((key, value)) = parse_key_value(line) {
                    if RECOGNIZED_HEADER_KEYS.contains(&key) {
                        header.insert(key.to_string(), value.to_string());
                    } else {
                        warn!("ignoring unrecognized descriptor key '{}' at line {}", key, lineno + 1);
                    }
                }
            }
            "extent" => {
                extents.push(line.parse::<ExtentSpec>().map_err(|e| {
                    Error::input(format!("line {}, column 1: {}", lineno + 1, e))
                })?);
            }
            "ddb" => {
                if let Some((key, _value)) = parse_key_value(line) {
                    if !RECOGNIZED_DDB_KEYS.contains(&key) {
                        warn!("ignoring unrecognized ddb key '{}' at line {}", key, lineno + 1);
                    }
                }
            }
            _ => {}
        }
    }

    let content_identifier = header
        .get("CID")
        .map(|v| u32::from_str_radix(v, 16))
        .transpose()
        .map_err(|_| Error::input("invalid CID"))?
        .unwrap_or(0);
    let parent_content_identifier = header
        .get("parentCID")
        .map(|v| u32::from_str_radix(v, 16))
        .transpose()
        .map_err(|_| Error::input("invalid parentCID"))?
        .unwrap_or(0xffff_ffff);
    let disk_type = header
        .get("createType")
        .ok_or_else(|| Error::input("missing createType in descriptor"))?
        .parse()?;
    let parent_filename = header.get("parentFileNameHint").cloned();
    let encoding = header.get("encoding").cloned();

    Ok(ImageModel {
        content_identifier,
        parent_content_identifier,
        disk_type,
        parent_filename,
        extents,
        encoding,
    })
}
