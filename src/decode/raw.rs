//! RAW decode chain.
//!
//! RAW files are handed to external engines in the configured priority order
//! (`raw.engine_order`, default libraw → dcraw → vips → magick). The first
//! engine that exits cleanly and leaves a non-empty file wins. Absent tools
//! are skipped without being spawned.
//!
//! | Target | Chain | Intermediate |
//! |---|---|---|
//! | TIFF | libraw, dcraw, vips, magick | TIFF |
//! | PSD | TIFF chain, then vips → JPEG | TIFF, else high-quality JPEG |
//! | JPEG (and unknown) | libraw, dcraw, vips | JPEG; retried once via vips when small |
//! | PNG, WebP, SVG | libraw, dcraw, vips | TIFF or PNG |
//!
//! A JPEG under `raw.min_jpeg_bytes` is retried via vips from any chain
//! position except when vips itself produced it.
//!
//! Each attempt runs in its own scratch directory. dcraw and dcraw_emu write
//! their TIFF next to their input, which is why the input is staged there.

use super::{
    AttemptError, DecodeError, DecodeOutcome, Strategy, find_output, first_success, stage_input,
};
use crate::config::{ConverterConfig, RawEngine};
use crate::encode;
use crate::format::{Container, TargetFormat};
use crate::tools::{Tool, ToolRunner, Toolbox};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What a strategy should leave behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intermediate {
    Tiff,
    Png,
    Jpeg { quality: u8 },
}

impl Intermediate {
    fn container(self) -> Container {
        match self {
            Intermediate::Tiff => Container::Tiff,
            Intermediate::Png => Container::Png,
            Intermediate::Jpeg { .. } => Container::Jpeg,
        }
    }
}

fn tool_for(engine: RawEngine) -> Tool {
    match engine {
        RawEngine::Libraw => Tool::LibRaw,
        RawEngine::Dcraw => Tool::Dcraw,
        RawEngine::Vips => Tool::Vips,
        RawEngine::Magick => Tool::Magick,
    }
}

/// Drives the RAW chain for one job.
pub struct RawDecoder<'a, R: ToolRunner> {
    tools: &'a Toolbox<'a, R>,
    config: &'a ConverterConfig,
    scratch_root: &'a Path,
}

impl<'a, R: ToolRunner> RawDecoder<'a, R> {
    pub fn new(tools: &'a Toolbox<'a, R>, config: &'a ConverterConfig, scratch_root: &'a Path) -> Self {
        Self {
            tools,
            config,
            scratch_root,
        }
    }

    /// Decode `input` (displayed as `file`) for `target`.
    pub fn decode(
        &self,
        input: &Path,
        file: &str,
        target: &TargetFormat,
    ) -> Result<DecodeOutcome, DecodeError> {
        match target.container() {
            Container::Tiff => self.run_chain(input, file, &self.engines(true), Intermediate::Tiff),
            Container::Psd => self.decode_for_psd(input, file),
            Container::Jpeg => self.decode_jpeg(input, file),
            Container::Png | Container::Webp | Container::Svg => {
                self.run_chain(input, file, &self.engines(false), Intermediate::Png)
            }
        }
    }

    /// Configured engines that are installed. ImageMagick only takes part in
    /// TIFF-producing chains.
    fn engines(&self, allow_magick: bool) -> Vec<RawEngine> {
        self.config
            .raw
            .engine_order
            .iter()
            .copied()
            .filter(|e| allow_magick || *e != RawEngine::Magick)
            .filter(|e| {
                let present = self.tools.has(tool_for(*e));
                if !present {
                    debug!(engine = %e, "skipping engine, not installed");
                }
                present
            })
            .collect()
    }

    fn run_chain(
        &self,
        input: &Path,
        file: &str,
        engines: &[RawEngine],
        want: Intermediate,
    ) -> Result<DecodeOutcome, DecodeError> {
        let strategies = engines.iter().map(|engine| {
            Strategy::new(engine.to_string(), move || self.attempt(*engine, input, want))
        });
        first_success(file, strategies, self.tools.availability)
    }

    fn decode_for_psd(&self, input: &Path, file: &str) -> Result<DecodeOutcome, DecodeError> {
        let tiff_err = match self.run_chain(input, file, &self.engines(true), Intermediate::Tiff) {
            Ok(outcome) => return Ok(outcome),
            Err(e) => e,
        };
        warn!(file, "no TIFF intermediate for PSD, falling back to JPEG");
        let want = Intermediate::Jpeg {
            quality: self.config.encode.psd_intermediate_quality,
        };
        let vips: Vec<RawEngine> = self
            .engines(false)
            .into_iter()
            .filter(|e| *e == RawEngine::Vips)
            .collect();
        self.run_chain(input, file, &vips, want)
            .map_err(|fallback_err| merge_attempts(tiff_err, fallback_err))
    }

    fn decode_jpeg(&self, input: &Path, file: &str) -> Result<DecodeOutcome, DecodeError> {
        let want = Intermediate::Jpeg {
            quality: self.config.encode.jpeg_quality,
        };
        let outcome = self.run_chain(input, file, &self.engines(false), want)?;

        let threshold = self.config.raw.min_jpeg_bytes;
        let size = outcome_size(&outcome);
        if size >= threshold || outcome.engine == RawEngine::Vips.to_string() {
            return Ok(outcome);
        }
        if !self.tools.has(Tool::Vips) {
            warn!(file, size, threshold, engine = %outcome.engine, "small JPEG result, vips unavailable for retry");
            return Ok(outcome);
        }

        info!(file, size, threshold, engine = %outcome.engine, "small JPEG result, retrying via vips");
        match self.attempt(RawEngine::Vips, input, want) {
            Ok(retry) if outcome_size(&retry) > size => {
                debug!(file, size = outcome_size(&retry), "keeping vips retry");
                Ok(retry)
            }
            Ok(_) => Ok(outcome),
            Err(e) => {
                warn!(file, "vips retry failed: {e}");
                Ok(outcome)
            }
        }
    }

    /// One engine, one scratch directory.
    fn attempt(
        &self,
        engine: RawEngine,
        input: &Path,
        want: Intermediate,
    ) -> Result<DecodeOutcome, AttemptError> {
        let staged = stage_input(input, self.scratch_root)?;
        let dir = staged.dir.path().to_path_buf();
        let label = engine.to_string();

        let produced = match engine {
            RawEngine::Libraw | RawEngine::Dcraw => {
                let args: [&OsStr; 3] = ["-w".as_ref(), "-T".as_ref(), staged.input.as_os_str()];
                self.tools.run(tool_for(engine), args, &dir)?;
                // dcraw replaces the extension, dcraw_emu appends to it.
                let mut appended = staged.input.clone().into_os_string();
                appended.push(".tiff");
                let candidates = [staged.input.with_extension("tiff"), PathBuf::from(appended)];
                let tiff = find_output(&label, &candidates)?;
                if want == Intermediate::Tiff || want == Intermediate::Png {
                    (tiff, Container::Tiff)
                } else {
                    (self.reencode_jpeg(&tiff, &dir, want)?, Container::Jpeg)
                }
            }
            RawEngine::Vips => {
                let out = dir.join(format!("out.{}", want.container().extension()));
                let target = match want {
                    Intermediate::Jpeg { quality } => format!("{}[Q={quality}]", out.display()),
                    _ => out.display().to_string(),
                };
                let args: [&OsStr; 3] = ["copy".as_ref(), staged.input.as_os_str(), target.as_ref()];
                self.tools.run(Tool::Vips, args, &dir)?;
                (find_output(&label, &[out])?, want.container())
            }
            RawEngine::Magick => {
                let out = dir.join("out.tiff");
                let args: Vec<&OsStr> = vec![
                    staged.input.as_os_str(),
                    "-alpha".as_ref(),
                    "off".as_ref(),
                    "-depth".as_ref(),
                    "8".as_ref(),
                    "-compress".as_ref(),
                    "LZW".as_ref(),
                    out.as_os_str(),
                ];
                self.tools.run(Tool::Magick, args, &dir)?;
                (find_output(&label, &[out])?, Container::Tiff)
            }
        };

        let (path, container) = produced;
        Ok(DecodeOutcome::scratch_file(path, container, label, staged.dir))
    }

    /// Turn an engine's TIFF into a JPEG in the same scratch directory.
    fn reencode_jpeg(
        &self,
        tiff: &Path,
        dir: &Path,
        want: Intermediate,
    ) -> Result<PathBuf, AttemptError> {
        let Intermediate::Jpeg { quality } = want else {
            return Err(AttemptError::Rejected(format!(
                "unexpected intermediate {want:?}"
            )));
        };
        let img = image::ImageReader::open(tiff)?
            .with_guessed_format()?
            .decode()?;
        let bytes = encode::encode_jpeg(&img, quality)
            .map_err(|e| AttemptError::Rejected(e.to_string()))?;
        let out = dir.join("out.jpg");
        fs::write(&out, bytes)?;
        Ok(out)
    }
}

fn outcome_size(outcome: &DecodeOutcome) -> u64 {
    match &outcome.image {
        super::DecodedImage::File { path, .. } => fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        super::DecodedImage::Buffer(img) => img.as_bytes().len() as u64,
    }
}

fn merge_attempts(first: DecodeError, second: DecodeError) -> DecodeError {
    match (first, second) {
        (
            DecodeError::Exhausted {
                attempts: mut all, ..
            },
            DecodeError::Exhausted {
                file,
                last_error,
                attempts,
                availability,
            },
        ) => {
            all.extend(attempts);
            DecodeError::Exhausted {
                file,
                last_error,
                attempts: all,
                availability,
            }
        }
        (_, second) => second,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;
    use crate::tools::{ToolAvailability, probe::probe};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        input: PathBuf,
        config: ConverterConfig,
    }

    fn fixture(name: &str) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join(name);
        write_fake_raw(&input);
        Fixture {
            tmp,
            input,
            config: ConverterConfig::default(),
        }
    }

    fn decode_with(
        fx: &Fixture,
        runner: &ScriptedRunner,
        target: TargetFormat,
    ) -> Result<DecodeOutcome, DecodeError> {
        let availability = probe(runner, &fx.config.tools, Duration::from_secs(1));
        let tools = Toolbox::new(runner, &availability, Duration::from_secs(5));
        RawDecoder::new(&tools, &fx.config, fx.tmp.path()).decode(&fx.input, "photo.CR2", &target)
    }

    fn scratch_dirs(root: &Path) -> Vec<PathBuf> {
        fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.is_dir())
            .collect()
    }

    #[test]
    fn tiff_prefers_libraw() {
        let fx = fixture("photo.CR2");
        let runner = ScriptedRunner::new()
            .script("dcraw_emu", dcraw_emu_like(40, 30))
            .script("dcraw", dcraw_like(40, 30));
        let outcome = decode_with(&fx, &runner, TargetFormat::Tiff).unwrap();
        assert_eq!(outcome.engine, "libraw");
        assert_eq!(outcome.image.container(), Some(Container::Tiff));
        assert!(runner.work_invocations_of("dcraw").is_empty());
    }

    #[test]
    fn libraw_gets_white_balance_and_tiff_flags() {
        let fx = fixture("photo.CR2");
        let runner = ScriptedRunner::new().script("dcraw_emu", dcraw_emu_like(8, 8));
        decode_with(&fx, &runner, TargetFormat::Tiff).unwrap();
        let call = &runner.work_invocations_of("dcraw_emu")[0];
        let args = call.arg_strings();
        assert_eq!(&args[..2], ["-w", "-T"]);
        assert!(args[2].ends_with("input.cr2"));
        assert_ne!(call.cwd.as_deref(), Some(fx.tmp.path()));
    }

    #[test]
    fn tiff_falls_through_to_magick() {
        let fx = fixture("photo.CR2");
        let runner = ScriptedRunner::new()
            .fail("dcraw_emu")
            .fail("dcraw")
            .fail("vips")
            .script("magick", magick_like(20, 20));
        let outcome = decode_with(&fx, &runner, TargetFormat::Tiff).unwrap();
        assert_eq!(outcome.engine, "magick");
        let args = runner.work_invocations_of("magick")[0].arg_strings();
        assert_eq!(&args[1..7], ["-alpha", "off", "-depth", "8", "-compress", "LZW"]);
    }

    #[test]
    fn magick_is_not_used_for_png_targets() {
        let fx = fixture("photo.CR2");
        let runner = ScriptedRunner::new().script("magick", magick_like(20, 20));
        let err = decode_with(&fx, &runner, TargetFormat::Png).unwrap_err();
        assert!(matches!(err, DecodeError::Exhausted { .. }));
        assert!(runner.work_invocations_of("magick").is_empty());
    }

    #[test]
    fn missing_output_moves_to_next_engine() {
        let fx = fixture("photo.CR2");
        // Exits zero but writes nothing.
        let runner = ScriptedRunner::new()
            .succeed("dcraw_emu")
            .script("dcraw", dcraw_like(16, 16));
        let outcome = decode_with(&fx, &runner, TargetFormat::Png).unwrap();
        assert_eq!(outcome.engine, "dcraw");
    }

    #[test]
    fn all_tools_absent_is_exhausted_with_snapshot() {
        let fx = fixture("photo.CR2");
        let runner = ScriptedRunner::new();
        match decode_with(&fx, &runner, TargetFormat::Jpg) {
            Err(DecodeError::Exhausted {
                availability,
                attempts,
                ..
            }) => {
                assert_eq!(availability, ToolAvailability::none());
                assert!(attempts.is_empty());
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[test]
    fn failed_attempts_leave_no_scratch() {
        let fx = fixture("photo.CR2");
        let runner = ScriptedRunner::new().fail("dcraw_emu").fail("dcraw").fail("vips");
        assert!(decode_with(&fx, &runner, TargetFormat::Webp).is_err());
        assert!(scratch_dirs(fx.tmp.path()).is_empty());
    }

    #[test]
    fn outcome_scratch_is_removed_on_drop() {
        let fx = fixture("photo.CR2");
        let runner = ScriptedRunner::new().script("dcraw", dcraw_like(16, 16));
        let outcome = decode_with(&fx, &runner, TargetFormat::Tiff).unwrap();
        assert_eq!(scratch_dirs(fx.tmp.path()).len(), 1);
        drop(outcome);
        assert!(scratch_dirs(fx.tmp.path()).is_empty());
    }

    #[test]
    fn jpeg_from_large_decode_is_not_retried() {
        let fx = fixture("photo.CR2");
        let runner = ScriptedRunner::new()
            .script("dcraw_emu", dcraw_emu_like(400, 300))
            .script("vips", vips_like(400, 300));
        let outcome = decode_with(&fx, &runner, TargetFormat::Jpg).unwrap();
        assert_eq!(outcome.engine, "libraw");
        assert_eq!(outcome.image.container(), Some(Container::Jpeg));
        assert!(runner.work_invocations_of("vips").is_empty());
    }

    #[test]
    fn small_jpeg_is_retried_via_vips_and_larger_kept() {
        let fx = fixture("photo.CR2");
        let runner = ScriptedRunner::new()
            .script("dcraw", dcraw_like(8, 8))
            .script("vips", vips_like(400, 300));
        let outcome = decode_with(&fx, &runner, TargetFormat::Jpg).unwrap();
        assert_eq!(outcome.engine, "vips");
        assert!(outcome_size(&outcome) > 16 * 1024);
        let args = runner.work_invocations_of("vips")[0].arg_strings();
        assert_eq!(args[0], "copy");
        assert!(args[2].ends_with("out.jpg[Q=90]"));
    }

    #[test]
    fn small_jpeg_retry_keeps_original_when_retry_is_smaller() {
        let fx = fixture("photo.CR2");
        let runner = ScriptedRunner::new()
            .script("dcraw", dcraw_like(64, 64))
            .script("vips", tiny_vips_like());
        let outcome = decode_with(&fx, &runner, TargetFormat::Jpg).unwrap();
        assert_eq!(outcome.engine, "dcraw");
        assert_eq!(runner.work_invocations_of("vips").len(), 1);
    }

    #[test]
    fn small_jpeg_from_vips_is_not_retried() {
        let fx = fixture("photo.CR2");
        let runner = ScriptedRunner::new().script("vips", vips_like(8, 8));
        let outcome = decode_with(&fx, &runner, TargetFormat::Jpg).unwrap();
        assert_eq!(outcome.engine, "vips");
        assert!(outcome_size(&outcome) < 16 * 1024);
        assert_eq!(runner.work_invocations_of("vips").len(), 1);
    }

    #[test]
    fn retry_threshold_is_configurable() {
        let mut fx = fixture("photo.CR2");
        fx.config.raw.min_jpeg_bytes = 1;
        let runner = ScriptedRunner::new()
            .script("dcraw", dcraw_like(8, 8))
            .script("vips", vips_like(400, 300));
        let outcome = decode_with(&fx, &runner, TargetFormat::Jpg).unwrap();
        assert_eq!(outcome.engine, "dcraw");
        assert!(runner.work_invocations_of("vips").is_empty());
    }

    #[test]
    fn engine_order_is_configurable() {
        let mut fx = fixture("photo.CR2");
        fx.config.raw.engine_order = vec![RawEngine::Vips, RawEngine::Libraw];
        let runner = ScriptedRunner::new()
            .script("dcraw_emu", dcraw_emu_like(40, 30))
            .script("vips", vips_like(40, 30));
        let outcome = decode_with(&fx, &runner, TargetFormat::Png).unwrap();
        assert_eq!(outcome.engine, "vips");
        assert!(runner.work_invocations_of("dcraw_emu").is_empty());
    }

    #[test]
    fn psd_uses_tiff_intermediate() {
        let fx = fixture("photo.CR2");
        let runner = ScriptedRunner::new().script("dcraw", dcraw_like(16, 16));
        let outcome = decode_with(&fx, &runner, TargetFormat::Psd).unwrap();
        assert_eq!(outcome.image.container(), Some(Container::Tiff));
    }

    #[test]
    fn psd_falls_back_to_jpeg_intermediate() {
        let fx = fixture("photo.CR2");
        // vips cannot write the TIFF but can write the JPEG.
        let runner = ScriptedRunner::new().script("vips", |inv| {
            if is_probe(inv) {
                return Ok(());
            }
            let out = inv.arg_strings()[2].clone();
            if out.contains(".tiff") {
                Err(ScriptedRunner::exit_error(inv, "tiff save failed"))
            } else {
                vips_like(32, 32)(inv)
            }
        });
        let outcome = decode_with(&fx, &runner, TargetFormat::Psd).unwrap();
        assert_eq!(outcome.image.container(), Some(Container::Jpeg));
        let calls = runner.work_invocations_of("vips");
        assert_eq!(calls.len(), 2);
        assert!(calls[1].arg_strings()[2].ends_with("[Q=92]"));
    }

    #[test]
    fn psd_failure_lists_both_chains() {
        let fx = fixture("photo.CR2");
        let runner = ScriptedRunner::new().fail("vips");
        match decode_with(&fx, &runner, TargetFormat::Psd) {
            Err(DecodeError::Exhausted { attempts, .. }) => assert_eq!(attempts.len(), 2),
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[test]
    #[ignore] // Requires dcraw_emu or dcraw and a real RAW file in IMGCONVERT_RAW_FIXTURE
    fn real_raw_decode() {
        let Ok(path) = std::env::var("IMGCONVERT_RAW_FIXTURE") else {
            return;
        };
        let tmp = TempDir::new().unwrap();
        let config = ConverterConfig::default();
        let runner = crate::tools::SystemRunner::new();
        let availability = probe(&runner, &config.tools, Duration::from_secs(5));
        let tools = Toolbox::new(&runner, &availability, Duration::from_secs(120));
        let outcome = RawDecoder::new(&tools, &config, tmp.path())
            .decode(Path::new(&path), "fixture", &TargetFormat::Jpg)
            .unwrap();
        assert!(outcome_size(&outcome) > config.raw.min_jpeg_bytes);
    }
}
