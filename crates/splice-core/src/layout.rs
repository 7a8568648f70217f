//! Memory layout of the supported target build.
//!
//! Every address the engine touches is described here as a module
//! relative offset, so a layout file for a new game build is enough to
//! retarget the whole engine without a rebuild. The defaults match the
//! build the offsets were taken from.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::chain::AddressChain;
use crate::codegen::reloc::BranchSite;
use crate::error::{Error, Result};

/// A relative conditional branch inside an injection window that needs
/// relocation when the window is displaced into a cave.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelativeBranch {
    pub offset: usize,
    pub opcode_len: usize,
    pub instr_len: usize,
}

impl From<RelativeBranch> for BranchSite {
    fn from(branch: RelativeBranch) -> Self {
        BranchSite {
            offset: branch.offset,
            opcode_len: branch.opcode_len,
            instr_len: branch.instr_len,
        }
    }
}

/// A hookable instruction window: where it starts and how many whole
/// instructions' worth of bytes get displaced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InjectionPoint {
    pub offset: u64,
    pub replace_len: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<RelativeBranch>,
}

impl InjectionPoint {
    pub fn chain(&self, module: &str) -> AddressChain {
        AddressChain::module_base(module).offset(self.offset as i64)
    }
}

/// Site whose shipped bytes identify an unhooked target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeSite {
    pub offset: u64,
    /// Shipped instruction bytes as spaced hex, e.g. `"48 63 42 34"`.
    pub signature: String,
}

impl ProbeSite {
    pub fn chain(&self, module: &str) -> AddressChain {
        AddressChain::module_base(module).offset(self.offset as i64)
    }

    pub fn signature_bytes(&self) -> Result<Vec<u8>> {
        parse_pattern(&self.signature)
    }
}

/// Field offsets inside the player's unit object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerOffsets {
    pub health: i64,
    pub shield: i64,
    pub shield_regen_delay: i64,
    pub unit_kind: i64,
    /// Discriminator value identifying the player's own unit.
    pub player_unit_kind: i16,
}

/// Complete layout for one target build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TargetLayout {
    pub process_name: String,
    pub module_name: String,
    /// Runs whenever the player's unit is updated; rsi holds the unit
    /// pointer. Contains a near Jcc that needs relocation.
    pub player_base: InjectionPoint,
    /// Runs in the script engine's update path; the splice window for
    /// the effect-channel prologue.
    pub script_comm: InjectionPoint,
    /// Two sites on the gameplay tick path, hooked to prove the game is
    /// actively simulating (both advance counters every tick).
    pub gameplay_poll_primary: InjectionPoint,
    pub gameplay_poll_secondary: InjectionPoint,
    pub probe: ProbeSite,
    pub player: PlayerOffsets,
}

impl Default for TargetLayout {
    fn default() -> Self {
        Self {
            process_name: "MCC-Win64-Shipping".to_string(),
            module_name: "halo1.dll".to_string(),
            player_base: InjectionPoint {
                offset: 0xC5_0557,
                replace_len: 0x17,
                branch: Some(RelativeBranch {
                    offset: 0x0E,
                    opcode_len: 2,
                    instr_len: 6,
                }),
            },
            script_comm: InjectionPoint {
                offset: 0xAC_C0E9,
                replace_len: 0x10,
                branch: None,
            },
            gameplay_poll_primary: InjectionPoint {
                offset: 0xBB_331D,
                replace_len: 0x13,
                branch: None,
            },
            gameplay_poll_secondary: InjectionPoint {
                offset: 0xAD_1EA1,
                replace_len: 0x10,
                branch: None,
            },
            probe: ProbeSite {
                offset: 0xAC_C0E9,
                signature: "48 63 42 34".to_string(),
            },
            player: PlayerOffsets {
                health: 0x9C,
                shield: 0xA0,
                shield_regen_delay: 0xC0,
                unit_kind: 0x9A3,
                player_unit_kind: 0x3F,
            },
        }
    }
}

/// Parse a spaced-hex byte pattern like `"48 63 42 34"`.
pub fn parse_pattern(pattern: &str) -> Result<Vec<u8>> {
    pattern
        .split_whitespace()
        .map(|token| {
            u8::from_str_radix(token, 16)
                .map_err(|_| Error::InvalidPattern(format!("bad byte '{token}' in '{pattern}'")))
        })
        .collect()
}

/// Load a layout from a JSON file.
pub fn load_layout(path: impl AsRef<Path>) -> Result<TargetLayout> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let layout: TargetLayout = serde_json::from_str(&contents)?;
    // Fail on a bad signature at load time, not mid-poll.
    layout.probe.signature_bytes()?;
    info!("Loaded layout for {} from {}", layout.module_name, path.display());
    Ok(layout)
}

/// Write a layout as pretty-printed JSON.
pub fn save_layout(layout: &TargetLayout, path: impl AsRef<Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(layout)?;
    fs::write(path.as_ref(), json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_the_supported_build() {
        let layout = TargetLayout::default();
        assert_eq!(layout.module_name, "halo1.dll");
        assert_eq!(layout.player_base.replace_len, 0x17);
        assert_eq!(layout.probe.signature_bytes().unwrap(), vec![0x48, 0x63, 0x42, 0x34]);
        assert_eq!(layout.player.health, 0x9C);
    }

    #[test]
    fn pattern_parsing_rejects_junk() {
        assert_eq!(parse_pattern("48 A1 00").unwrap(), vec![0x48, 0xA1, 0x00]);
        assert!(matches!(
            parse_pattern("48 GG"),
            Err(Error::InvalidPattern(_))
        ));
    }

    #[test]
    fn layout_roundtrips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.json");

        let mut layout = TargetLayout::default();
        layout.player_base.offset = 0xDE_AD00;
        save_layout(&layout, &path).unwrap();

        let loaded = load_layout(&path).unwrap();
        assert_eq!(loaded, layout);
    }

    #[test]
    fn partial_layout_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.json");
        fs::write(&path, r#"{ "module_name": "halo2.dll" }"#).unwrap();

        let loaded = load_layout(&path).unwrap();
        assert_eq!(loaded.module_name, "halo2.dll");
        assert_eq!(loaded.player_base, TargetLayout::default().player_base);
    }

    #[test]
    fn bad_signature_fails_at_load_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layout.json");
        let mut layout = TargetLayout::default();
        layout.probe.signature = "not hex".to_string();
        save_layout(&layout, &path).unwrap();

        assert!(matches!(load_layout(&path), Err(Error::InvalidPattern(_))));
    }
}
