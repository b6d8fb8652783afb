//! The layout tree, encoded as two flat tables (§3, §6.2), plus its
//! line-oriented text persistence format.

use crate::error::{HibfError, Result};
use std::fmt::Write as _;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One entry in [`Layout::max_bins`]: records, for a lower-level IBF, the
/// path of parent technical-bin indices leading to it and which of its own
/// technical bins is the "fullest" (FPR-determining) one.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MaxBinEntry {
    /// Path of parent technical-bin indices, root first.
    pub previous_trace: Vec<usize>,
    /// Index of the fullest technical bin within this lower-level IBF.
    pub fullest_technical_bin_idx: usize,
}

/// One entry in [`Layout::user_bins`]: records where a single input user
/// bin's hashes were placed.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UserBinEntry {
    /// Path of parent technical-bin indices, root first.
    pub previous_trace: Vec<usize>,
    /// Starting technical-bin index in the leaf IBF.
    pub technical_bin_idx: usize,
    /// Number of consecutive technical bins occupied (split count).
    pub number_of_technical_bins: usize,
    /// Source user-bin id.
    pub user_bin_idx: usize,
}

/// The layout produced by the binning DP: a tree encoded as two flat
/// tables, persisted independently of the IBFs they describe.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Layout {
    /// One entry per lower-level (merged) IBF.
    pub max_bins: Vec<MaxBinEntry>,
    /// One entry per input user bin.
    pub user_bins: Vec<UserBinEntry>,
}

fn format_path(path: &[usize]) -> String {
    path.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(";")
}

fn parse_path(s: &str) -> Result<Vec<usize>> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split(';')
        .map(|part| {
            part.parse::<usize>()
                .map_err(|_| HibfError::LayoutParseError(format!("invalid path component: {part}")))
        })
        .collect()
}

impl Layout {
    /// Writes the line-oriented text layout format described in §6.2:
    /// one header line per max-bin entry (`#TOP_LEVEL_IBF` for the empty
    /// path, `#LOWER_LEVEL_IBF_<path>` otherwise), then a column header and
    /// one tab-separated line per user bin.
    pub fn write_to<W: std::fmt::Write>(&self, out: &mut W) -> std::fmt::Result {
        // Root entry, if present, is the max_bins entry with an empty path.
        for entry in &self.max_bins {
            if entry.previous_trace.is_empty() {
                writeln!(out, "#TOP_LEVEL_IBF fullest_technical_bin_idx:{}", entry.fullest_technical_bin_idx)?;
            } else {
                writeln!(
                    out,
                    "#LOWER_LEVEL_IBF_{} fullest_technical_bin_idx:{}",
                    format_path(&entry.previous_trace),
                    entry.fullest_technical_bin_idx
                )?;
            }
        }

        writeln!(out, "#USER_BIN_IDX\tTECHNICAL_BIN_INDICES\tNUMBER_OF_TECHNICAL_BINS")?;
        for ub in &self.user_bins {
            let mut full_path = ub.previous_trace.clone();
            full_path.push(ub.technical_bin_idx);
            let splits = vec!["1"; ub.number_of_technical_bins.max(1)].join(";");
            writeln!(
                out,
                "{}\t{}\t{}",
                ub.user_bin_idx,
                format_path(&full_path),
                splits
            )?;
        }
        Ok(())
    }

    /// Parses the text layout format written by [`Self::write_to`].
    pub fn read_from(text: &str) -> Result<Self> {
        let mut max_bins = Vec::new();
        let mut user_bins = Vec::new();

        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("#TOP_LEVEL_IBF ") {
                let n = parse_fullest(rest)?;
                max_bins.push(MaxBinEntry {
                    previous_trace: Vec::new(),
                    fullest_technical_bin_idx: n,
                });
            } else if let Some(rest) = line.strip_prefix("#LOWER_LEVEL_IBF_") {
                let (path_part, fullest_part) = rest
                    .split_once(' ')
                    .ok_or_else(|| HibfError::LayoutParseError(format!("malformed header: {line}")))?;
                let path = parse_path(path_part)?;
                let n = parse_fullest(fullest_part)?;
                max_bins.push(MaxBinEntry {
                    previous_trace: path,
                    fullest_technical_bin_idx: n,
                });
            } else if line.starts_with('#') {
                // column header line, ignored
                continue;
            } else {
                let mut fields = line.split('\t');
                let user_bin_idx = fields
                    .next()
                    .ok_or_else(|| HibfError::LayoutParseError("missing user bin idx".into()))?
                    .parse::<usize>()
                    .map_err(|_| HibfError::LayoutParseError("bad user bin idx".into()))?;
                let path_field = fields
                    .next()
                    .ok_or_else(|| HibfError::LayoutParseError("missing technical bin indices".into()))?;
                let split_field = fields
                    .next()
                    .ok_or_else(|| HibfError::LayoutParseError("missing split counts".into()))?;

                let mut full_path = parse_path(path_field)?;
                let technical_bin_idx = full_path
                    .pop()
                    .ok_or_else(|| HibfError::LayoutParseError("empty technical bin index path".into()))?;
                let number_of_technical_bins = split_field.split(';').count();

                user_bins.push(UserBinEntry {
                    previous_trace: full_path,
                    technical_bin_idx,
                    number_of_technical_bins,
                    user_bin_idx,
                });
            }
        }

        Ok(Layout { max_bins, user_bins })
    }
}

fn parse_fullest(s: &str) -> Result<usize> {
    s.strip_prefix("fullest_technical_bin_idx:")
        .ok_or_else(|| HibfError::LayoutParseError(format!("missing fullest_technical_bin_idx in: {s}")))?
        .trim()
        .parse::<usize>()
        .map_err(|_| HibfError::LayoutParseError(format!("bad fullest_technical_bin_idx in: {s}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_format_round_trips() {
        let layout = Layout {
            max_bins: vec![
                MaxBinEntry {
                    previous_trace: vec![],
                    fullest_technical_bin_idx: 4,
                },
                MaxBinEntry {
                    previous_trace: vec![4],
                    fullest_technical_bin_idx: 2,
                },
            ],
            user_bins: vec![
                UserBinEntry {
                    previous_trace: vec![],
                    technical_bin_idx: 0,
                    number_of_technical_bins: 1,
                    user_bin_idx: 0,
                },
                UserBinEntry {
                    previous_trace: vec![4],
                    technical_bin_idx: 1,
                    number_of_technical_bins: 2,
                    user_bin_idx: 1,
                },
            ],
        };

        let mut text = String::new();
        layout.write_to(&mut text).unwrap();
        let parsed = Layout::read_from(&text).unwrap();
        assert_eq!(layout, parsed);
    }
}
