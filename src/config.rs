//! Build configuration (§6.1).

use crate::error::{HibfError, Result};
use crate::insert_iterator::InsertIterator;

/// Configuration for building an (H)IBF.
///
/// When constructing a standalone [`crate::InterleavedBloomFilter`], only
/// `number_of_hash_functions` and `maximum_fpr` are relevant; the layout
/// fields are ignored. `validate_and_set_defaults` must be called (and
/// succeed) before the config is used to build anything.
pub struct Config {
    /// Generator of 64-bit hashes for a given user bin id. Required.
    pub input_fn: Option<Box<dyn Fn(usize, &mut InsertIterator<'_>) + Send + Sync>>,
    /// Number of user bins. Required, must be `>= 1`.
    pub number_of_user_bins: usize,
    /// Number of Bloom hash functions; default 2, must be in `[1,5]`.
    pub number_of_hash_functions: usize,
    /// Strict target FPR for accuracy-critical bins; default 0.05, in `(0,1)`.
    pub maximum_fpr: f64,
    /// Allowed FPR for merged bins; default 0.3, in `(0,1)`, `>= maximum_fpr`.
    pub relaxed_fpr: f64,
    /// Worker count for build; default 1, must be `> 0`.
    pub threads: usize,
    /// HyperLogLog precision; default 12, must be in `[5,32]`.
    pub sketch_bits: u8,
    /// Maximum technical bins per IBF; `0` means "compute a default".
    pub tmax: usize,
    /// DP cost weight on lower-level IBFs; default 1.2, must be `>= 0`.
    pub alpha: f64,
    /// Fraction of technical bins left empty at each IBF; default 0.0, in `[0,1)`.
    pub empty_bin_fraction: f64,
    /// Interval-size ratio for the rearrangement algorithm; default 0.5, in `[0,1]`.
    pub max_rearrangement_ratio: f64,
    /// Skip HLL union estimates in the DP.
    pub disable_estimate_union: bool,
    /// Skip content-similarity rearrangement.
    pub disable_rearrangement: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_fn: None,
            number_of_user_bins: 0,
            number_of_hash_functions: 2,
            maximum_fpr: 0.05,
            relaxed_fpr: 0.3,
            threads: 1,
            sketch_bits: 12,
            tmax: 0,
            alpha: 1.2,
            empty_bin_fraction: 0.0,
            max_rearrangement_ratio: 0.5,
            disable_estimate_union: false,
            disable_rearrangement: false,
        }
    }
}

impl Config {
    /// Checks every constraint and fills in defaults, rejecting the config
    /// with a descriptive [`HibfError::InvalidConfig`] on the first
    /// violation. Mirrors the reference implementation's
    /// `validate_and_set_defaults` contract:
    ///
    /// - `number_of_user_bins` must be `> 0` and `input_fn` must be set.
    /// - `number_of_hash_functions` in `[1,5]`.
    /// - `maximum_fpr`, `relaxed_fpr` in `(0,1)`; `relaxed_fpr >= maximum_fpr`.
    /// - `threads > 0`.
    /// - `sketch_bits` in `[5,32]`.
    /// - `tmax <= u64::MAX - 64`.
    /// - `alpha >= 0`.
    /// - `max_rearrangement_ratio` in `[0,1]`.
    /// - `empty_bin_fraction` in `[0,1)`.
    /// - Enabling `disable_estimate_union`, or `max_rearrangement_ratio == 0`,
    ///   also forces `disable_rearrangement = true`.
    /// - `tmax == 0` defaults to `ceil(sqrt(number_of_user_bins))`, rounded up
    ///   to the next multiple of 64; any other `tmax` is itself rounded up to
    ///   the next multiple of 64 (logged as a warning, not an error).
    pub fn validate_and_set_defaults(&mut self) -> Result<()> {
        if self.number_of_user_bins == 0 {
            return Err(HibfError::InvalidConfig("number_of_user_bins must be set to a value other than 0".into()));
        }
        if self.input_fn.is_none() {
            return Err(HibfError::InvalidConfig("input_fn is required".into()));
        }
        if !(1..=5).contains(&self.number_of_hash_functions) {
            return Err(HibfError::InvalidConfig("number_of_hash_functions must be in [1,5]".into()));
        }
        if !(self.maximum_fpr > 0.0 && self.maximum_fpr < 1.0) {
            return Err(HibfError::InvalidConfig("maximum_fpr must be in (0.0,1.0)".into()));
        }
        if !(self.relaxed_fpr > 0.0 && self.relaxed_fpr < 1.0) {
            return Err(HibfError::InvalidConfig("relaxed_fpr must be in (0.0,1.0)".into()));
        }
        if self.relaxed_fpr < self.maximum_fpr {
            return Err(HibfError::InvalidConfig("relaxed_fpr must be >= maximum_fpr".into()));
        }
        if self.threads == 0 {
            return Err(HibfError::InvalidConfig("threads must be > 0".into()));
        }
        if !(5..=32).contains(&self.sketch_bits) {
            return Err(HibfError::InvalidConfig("sketch_bits must be in [5,32]".into()));
        }
        if self.tmax > (u64::MAX - 64) as usize {
            return Err(HibfError::InvalidConfig("tmax must be at most u64::MAX - 64".into()));
        }
        if self.alpha < 0.0 {
            return Err(HibfError::InvalidConfig("alpha must be >= 0".into()));
        }
        if !(0.0..=1.0).contains(&self.max_rearrangement_ratio) {
            return Err(HibfError::InvalidConfig("max_rearrangement_ratio must be in [0.0,1.0]".into()));
        }
        if !(0.0..1.0).contains(&self.empty_bin_fraction) {
            return Err(HibfError::InvalidConfig("empty_bin_fraction must be in [0.0,1.0)".into()));
        }

        if self.disable_estimate_union || self.max_rearrangement_ratio == 0.0 {
            self.disable_rearrangement = true;
        }

        if self.tmax == 0 {
            let sqrt_ub = (self.number_of_user_bins as f64).sqrt().ceil() as usize;
            self.tmax = next_multiple_of_64(sqrt_ub);
            log::debug!("tmax unset, defaulting to {}", self.tmax);
        } else {
            let rounded = next_multiple_of_64(self.tmax);
            if rounded != self.tmax {
                log::warn!("tmax {} rounded up to next multiple of 64: {}", self.tmax, rounded);
                self.tmax = rounded;
            }
        }

        Ok(())
    }
}

/// The fields of [`Config`] that can round-trip through the `@HIBF_CONFIG`
/// text block (§6.2): everything except `input_fn`, which is a closure and
/// cannot be serialised. A caller restoring a [`Config`] from a snapshot
/// must supply a fresh `input_fn` itself.
#[cfg(feature = "serde")]
#[derive(serde::Serialize, serde::Deserialize)]
pub struct ConfigSnapshot {
    /// See [`Config::number_of_user_bins`].
    pub number_of_user_bins: usize,
    /// See [`Config::number_of_hash_functions`].
    pub number_of_hash_functions: usize,
    /// See [`Config::maximum_fpr`].
    pub maximum_fpr: f64,
    /// See [`Config::relaxed_fpr`].
    pub relaxed_fpr: f64,
    /// See [`Config::threads`].
    pub threads: usize,
    /// See [`Config::sketch_bits`].
    pub sketch_bits: u8,
    /// See [`Config::tmax`].
    pub tmax: usize,
    /// See [`Config::alpha`].
    pub alpha: f64,
    /// See [`Config::empty_bin_fraction`].
    pub empty_bin_fraction: f64,
    /// See [`Config::max_rearrangement_ratio`].
    pub max_rearrangement_ratio: f64,
    /// See [`Config::disable_estimate_union`].
    pub disable_estimate_union: bool,
    /// See [`Config::disable_rearrangement`].
    pub disable_rearrangement: bool,
}

#[cfg(feature = "serde")]
impl From<&Config> for ConfigSnapshot {
    fn from(c: &Config) -> Self {
        Self {
            number_of_user_bins: c.number_of_user_bins,
            number_of_hash_functions: c.number_of_hash_functions,
            maximum_fpr: c.maximum_fpr,
            relaxed_fpr: c.relaxed_fpr,
            threads: c.threads,
            sketch_bits: c.sketch_bits,
            tmax: c.tmax,
            alpha: c.alpha,
            empty_bin_fraction: c.empty_bin_fraction,
            max_rearrangement_ratio: c.max_rearrangement_ratio,
            disable_estimate_union: c.disable_estimate_union,
            disable_rearrangement: c.disable_rearrangement,
        }
    }
}

#[cfg(feature = "serde")]
impl ConfigSnapshot {
    /// Applies every field of this snapshot onto `config`, leaving
    /// `config.input_fn` untouched.
    pub fn apply_to(&self, config: &mut Config) {
        config.number_of_user_bins = self.number_of_user_bins;
        config.number_of_hash_functions = self.number_of_hash_functions;
        config.maximum_fpr = self.maximum_fpr;
        config.relaxed_fpr = self.relaxed_fpr;
        config.threads = self.threads;
        config.sketch_bits = self.sketch_bits;
        config.tmax = self.tmax;
        config.alpha = self.alpha;
        config.empty_bin_fraction = self.empty_bin_fraction;
        config.max_rearrangement_ratio = self.max_rearrangement_ratio;
        config.disable_estimate_union = self.disable_estimate_union;
        config.disable_rearrangement = self.disable_rearrangement;
    }
}

#[cfg(feature = "serde")]
impl Config {
    /// Writes the `@HIBF_CONFIG`/`@HIBF_CONFIG_END` text block (§6.2): every
    /// field but `input_fn`, pretty-printed as JSON with each line prefixed
    /// by `@`.
    pub fn write_to<W: std::fmt::Write>(&self, out: &mut W) -> std::fmt::Result {
        let snapshot = ConfigSnapshot::from(self);
        let json = serde_json::to_string_pretty(&snapshot).expect("Config fields are all directly serialisable");
        writeln!(out, "@HIBF_CONFIG")?;
        for line in json.lines() {
            writeln!(out, "@{line}")?;
        }
        writeln!(out, "@HIBF_CONFIG_END")?;
        Ok(())
    }

    /// Parses a `@HIBF_CONFIG`/`@HIBF_CONFIG_END` text block previously
    /// written by [`Self::write_to`] and applies it onto `self`, leaving
    /// `self.input_fn` untouched.
    pub fn read_from(&mut self, text: &str) -> Result<()> {
        let mut json_lines = Vec::new();
        let mut in_block = false;
        for line in text.lines() {
            let line = line.trim_end();
            if line == "@HIBF_CONFIG" {
                in_block = true;
                continue;
            }
            if line == "@HIBF_CONFIG_END" {
                break;
            }
            if in_block {
                json_lines.push(line.strip_prefix('@').unwrap_or(line));
            }
        }
        if !in_block {
            return Err(HibfError::LayoutParseError("missing @HIBF_CONFIG block".into()));
        }
        let json = json_lines.join("\n");
        let snapshot: ConfigSnapshot = serde_json::from_str(&json)
            .map_err(|e| HibfError::LayoutParseError(format!("malformed @HIBF_CONFIG block: {e}")))?;
        snapshot.apply_to(self);
        Ok(())
    }
}

/// Rounds `n` up to the next multiple of 64 (0 stays 0... except the
/// reference semantics treat a requested 0 specially upstream; callers that
/// need "at least 64" should guard before calling this).
pub fn next_multiple_of_64(n: usize) -> usize {
    if n == 0 {
        return 64;
    }
    n.div_ceil(64) * 64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(n: usize) -> Config {
        Config {
            number_of_user_bins: n,
            input_fn: Some(Box::new(|_, _| {})),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_missing_user_bins() {
        let mut c = Config {
            input_fn: Some(Box::new(|_, _| {})),
            ..Default::default()
        };
        assert!(c.validate_and_set_defaults().is_err());
    }

    #[test]
    fn rejects_missing_input_fn() {
        let mut c = Config {
            number_of_user_bins: 3,
            ..Default::default()
        };
        assert!(c.validate_and_set_defaults().is_err());
    }

    #[test]
    fn defaults_tmax_to_rounded_sqrt() {
        let mut c = base_config(5000);
        c.validate_and_set_defaults().unwrap();
        // sqrt(5000) ~ 70.7 -> ceil 71 -> next multiple of 64 = 128
        assert_eq!(c.tmax, 128);
    }

    #[test]
    fn disables_rearrangement_when_union_estimate_disabled() {
        let mut c = base_config(100);
        c.disable_estimate_union = true;
        c.validate_and_set_defaults().unwrap();
        assert!(c.disable_rearrangement);
    }

    #[test]
    fn rejects_relaxed_fpr_below_maximum_fpr() {
        let mut c = base_config(100);
        c.relaxed_fpr = 0.01;
        c.maximum_fpr = 0.05;
        assert!(c.validate_and_set_defaults().is_err());
    }

    #[cfg(feature = "serde")]
    #[test]
    fn config_text_block_round_trips() {
        let mut c = base_config(500);
        c.tmax = 256;
        c.alpha = 2.5;

        let mut text = String::new();
        c.write_to(&mut text).unwrap();
        assert!(text.starts_with("@HIBF_CONFIG\n"));
        assert!(text.trim_end().ends_with("@HIBF_CONFIG_END"));

        let mut restored = Config::default();
        restored.read_from(&text).unwrap();
        assert_eq!(restored.number_of_user_bins, 500);
        assert_eq!(restored.tmax, 256);
        assert_eq!(restored.alpha, 2.5);
    }
}
