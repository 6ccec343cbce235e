//! MGRS tile allowlist.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;

/// Load the set of MGRS tile ids acceptable for downloading.
///
/// The file is newline-delimited 5-character tile codes; blank lines and
/// surrounding whitespace are ignored.
pub fn load_accepted_tile_ids(path: &Path) -> Result<HashSet<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tile allowlist at {:?}", path))?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Parse the MGRS tile id out of a product name.
///
/// The tile id is embedded in the filename as `_TXXXXX_`, where `XXXXX` is a
/// 5-character alphanumeric code (e.g. `S2B_MSIL1C_..._T31UFU_...`).
pub fn parse_tile_id(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    for start in name.match_indices("_T").map(|(i, _)| i) {
        let candidate = start + 2;
        if candidate + 5 >= bytes.len() {
            continue;
        }
        let tile = &bytes[candidate..candidate + 5];
        if bytes[candidate + 5] == b'_'
            && tile
                .iter()
                .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
        {
            return Some(name[candidate..candidate + 5].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_tile_id_from_product_name() {
        let name = "S2B_MSIL1C_20250127T105309_N0511_R051_T31UFU_20250127T113355.SAFE";
        assert_eq!(parse_tile_id(name).as_deref(), Some("31UFU"));
    }

    #[test]
    fn test_parse_tile_id_missing() {
        assert_eq!(parse_tile_id("S2B_MSIL1C_20250127T105309"), None);
        assert_eq!(parse_tile_id(""), None);
    }

    #[test]
    fn test_parse_tile_id_rejects_lowercase() {
        assert_eq!(parse_tile_id("S2B_Tabcde_tail"), None);
    }

    #[test]
    fn test_parse_tile_id_skips_short_candidates() {
        // First `_T` match is too short to be a tile segment, second is valid
        let name = "S2A_T12_R051_T18TWL_x";
        assert_eq!(parse_tile_id(name).as_deref(), Some("18TWL"));
    }

    #[test]
    fn test_load_accepted_tile_ids() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "31UFU").unwrap();
        writeln!(file, "  18TWL ").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "12ABC").unwrap();

        let tiles = load_accepted_tile_ids(file.path()).unwrap();
        assert_eq!(tiles.len(), 3);
        assert!(tiles.contains("31UFU"));
        assert!(tiles.contains("18TWL"));
        assert!(tiles.contains("12ABC"));
    }

    #[test]
    fn test_load_missing_file_is_an_error() {
        assert!(load_accepted_tile_ids(Path::new("/nonexistent/tiles.txt")).is_err());
    }
}
