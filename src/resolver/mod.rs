use regex::Regex;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::EffectiveConfig;
use crate::utils::runner::{CommandRunner, CommandSpec, ProcessError};
use crate::utils::{format_bytes, parse_byte_count};

pub const NOT_AVAILABLE: &str = "N/A";
pub const NOT_FOUND_MODEL: &str = "GPU not found!";
pub const NOT_FOUND_HINT: &str = "Make sure GPU drivers are installed.";

const NVIDIA_QUERY: [&str; 2] =
    ["--query-gpu=name,memory.total,memory.used,utilization.gpu", "--format=csv,noheader"];
const WMIC_QUERY: [&str; 4] = ["path", "win32_VideoController", "get", "Name,AdapterRAM"];
// Win32_VideoController.AdapterRAM is a uint32.
const ADAPTER_RAM_MAX_DIGITS: usize = 10;
// Without column padding, a trailing number shorter than 1 MB is read as part of the name.
const MIN_BARE_RAM_DIGITS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingSource {
    NvidiaSmi,
    Wmic,
    NotFound,
}

impl ReadingSource {
    pub fn label(self) -> &'static str {
        match self {
            ReadingSource::NvidiaSmi => "nvidia-smi",
            ReadingSource::Wmic => "wmic",
            ReadingSource::NotFound => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuReading {
    source: ReadingSource,
    model: String,
    total_memory: String,
    used_memory: String,
    utilization: String,
}

impl GpuReading {
    pub fn not_found() -> Self {
        Self {
            source: ReadingSource::NotFound,
            model: NOT_FOUND_MODEL.into(),
            total_memory: NOT_AVAILABLE.into(),
            used_memory: NOT_AVAILABLE.into(),
            utilization: NOT_AVAILABLE.into(),
        }
    }

    pub fn source(&self) -> ReadingSource {
        self.source
    }
    pub fn is_found(&self) -> bool {
        self.source != ReadingSource::NotFound
    }
    pub fn model(&self) -> &str {
        &self.model
    }
    pub fn total_memory(&self) -> &str {
        &self.total_memory
    }
    pub fn used_memory(&self) -> &str {
        &self.used_memory
    }
    pub fn utilization(&self) -> &str {
        &self.utilization
    }
}

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(#[from] ProcessError),
    #[error("{tool} produced no usable line")]
    UnparseableOutput { tool: &'static str },
    #[error("no GPU found")]
    NoGpuFound,
}

/// The two external queries, in fallback order.
#[derive(Debug, Clone)]
pub struct SourceCommands {
    pub nvidia_smi: CommandSpec,
    pub wmic: CommandSpec,
}

impl SourceCommands {
    pub fn from_config(cfg: &EffectiveConfig) -> Self {
        Self {
            nvidia_smi: CommandSpec::new(cfg.nvidia_smi_path.clone(), NVIDIA_QUERY),
            wmic: CommandSpec::new(cfg.wmic_path.clone(), WMIC_QUERY),
        }
    }
}

impl Default for SourceCommands {
    fn default() -> Self {
        Self::from_config(&EffectiveConfig::default())
    }
}

pub struct GpuResolver<R> {
    runner: R,
    commands: SourceCommands,
    skip_adapters: Vec<Regex>,
}

impl<R: CommandRunner> GpuResolver<R> {
    pub fn new(runner: R, commands: SourceCommands) -> Self {
        Self { runner, commands, skip_adapters: Vec::new() }
    }

    pub fn from_config(runner: R, cfg: &EffectiveConfig) -> Self {
        Self::new(runner, SourceCommands::from_config(cfg)).with_skip_adapters(cfg.skip_adapters.clone())
    }

    pub fn with_skip_adapters(mut self, patterns: Vec<Regex>) -> Self {
        self.skip_adapters = patterns;
        self
    }

    /// nvidia-smi first, then wmic, then the not-found reading. Never fails.
    pub async fn resolve(&self) -> GpuReading {
        match self.try_resolve().await {
            Ok(reading) => reading,
            Err(e) => {
                debug!(error = %e, "Falling back to not-found reading");
                GpuReading::not_found()
            }
        }
    }

    pub async fn try_resolve(&self) -> Result<GpuReading, ResolveError> {
        match self.query_nvidia_smi().await {
            Ok(reading) => return Ok(self.selected(reading)),
            Err(e) => debug!(command = %self.commands.nvidia_smi, error = %e, "nvidia-smi unusable"),
        }
        match self.query_wmic().await {
            Ok(reading) => return Ok(self.selected(reading)),
            Err(e) => debug!(command = %self.commands.wmic, error = %e, "wmic unusable"),
        }
        Err(ResolveError::NoGpuFound)
    }

    fn selected(&self, reading: GpuReading) -> GpuReading {
        info!(source = reading.source.label(), model = %reading.model, "GPU resolved");
        reading
    }

    async fn query_nvidia_smi(&self) -> Result<GpuReading, ResolveError> {
        let lines = self.runner.run(&self.commands.nvidia_smi).await?;
        lines
            .first()
            .and_then(|line| parse_nvidia_line(line))
            .ok_or(ResolveError::UnparseableOutput { tool: "nvidia-smi" })
    }

    async fn query_wmic(&self) -> Result<GpuReading, ResolveError> {
        let lines = self.runner.run(&self.commands.wmic).await?;
        lines
            .iter()
            .skip(1)
            .filter(|line| line.len() > 2)
            .filter_map(|line| parse_adapter_line(line))
            .find(|(name, _)| {
                let skipped = self.skip_adapters.iter().any(|re| re.is_match(name));
                if skipped {
                    debug!(adapter = %name, "Skipping adapter");
                }
                !skipped
            })
            .map(|(name, ram)| GpuReading {
                source: ReadingSource::Wmic,
                model: name,
                total_memory: ram.filter(|b| *b > 0).map(format_bytes).unwrap_or_else(|| NOT_AVAILABLE.into()),
                used_memory: NOT_AVAILABLE.into(),
                utilization: NOT_AVAILABLE.into(),
            })
            .ok_or(ResolveError::UnparseableOutput { tool: "wmic" })
    }
}

/// `<name>, <total>, <used>, <utilization>` as printed by
/// `nvidia-smi --format=csv,noheader`. Values are kept verbatim.
pub fn parse_nvidia_line(line: &str) -> Option<GpuReading> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [name, total, used, util] = fields.as_slice() else {
        return None;
    };
    if name.is_empty() {
        return None;
    }
    Some(GpuReading {
        source: ReadingSource::NvidiaSmi,
        model: name.to_string(),
        total_memory: total.to_string(),
        used_memory: used.to_string(),
        utilization: util.to_string(),
    })
}

/// Splits one `wmic ... get Name,AdapterRAM` data line into the adapter name
/// and its AdapterRAM byte count, if any.
///
/// Accepts the column layout wmic prints (`<ram>  <name>`) as well as a name
/// with the count appended (`<name><ram>`, optionally column padded).
pub fn parse_adapter_line(line: &str) -> Option<(String, Option<u64>)> {
    let line = line.trim_end_matches(['\r', '\n']).trim_end();
    if line.trim().is_empty() {
        return None;
    }

    let trimmed = line.trim_start();
    // wmic pads columns with at least two spaces.
    if let Some((digits, name)) = trimmed.split_once(char::is_whitespace) {
        if name.starts_with(char::is_whitespace) {
            if let Ok(ram) = parse_byte_count(digits) {
                let name = name.trim();
                return (!name.is_empty()).then(|| (name.to_string(), fits_adapter_ram(ram)));
            }
        }
    }

    let digits_at = line.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (head, digits) = line.split_at(digits_at);
    if digits.is_empty() {
        return Some((trimmed.to_string(), None));
    }

    let ram = parse_byte_count(digits).ok().and_then(fits_adapter_ram);
    let (name, ram) = if head.ends_with("  ") {
        (head.to_string(), ram)
    } else if digits.len() < MIN_BARE_RAM_DIGITS {
        // Short numbers such as "630" or "Voodoo3" belong to the model name.
        (line.to_string(), None)
    } else if ram.is_some() {
        (head.to_string(), ram)
    } else {
        let (model_digits, ram) = split_adapter_ram(digits);
        (format!("{}{}", head, model_digits), Some(ram))
    };

    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), ram))
}

/// AdapterRAM is a uint32 in WMI; anything larger was never a byte count.
fn fits_adapter_ram(ram: u64) -> Option<u64> {
    (ram <= u64::from(u32::MAX)).then_some(ram)
}

/// Longest suffix of `digits` (at most ten) whose value fits a uint32.
fn split_adapter_ram(digits: &str) -> (&str, u64) {
    let mut width = ADAPTER_RAM_MAX_DIGITS.min(digits.len());
    loop {
        let (head, tail) = digits.split_at(digits.len() - width);
        match parse_byte_count(tail).ok().and_then(fits_adapter_ram) {
            Some(v) => return (head, v),
            None if width > 1 => width -= 1,
            None => return (digits, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Clone)]
    enum Script {
        Lines(&'static str),
        Missing,
        ExitCode(i32),
        TimedOut,
    }

    /// Stands in for real subprocesses; answers by program name.
    struct ScriptedRunner {
        scripts: HashMap<&'static str, Script>,
        calls: RefCell<Vec<String>>,
    }

    impl ScriptedRunner {
        fn new(scripts: &[(&'static str, Script)]) -> Self {
            Self { scripts: scripts.iter().cloned().collect(), calls: RefCell::new(Vec::new()) }
        }
    }

    impl CommandRunner for ScriptedRunner {
        async fn run(&self, cmd: &CommandSpec) -> Result<Vec<String>, ProcessError> {
            self.calls.borrow_mut().push(cmd.program.clone());
            match self.scripts.get(cmd.program.as_str()).cloned().unwrap_or(Script::Missing) {
                Script::Lines(text) => Ok(crate::utils::runner::split_lines(text)),
                Script::Missing => Err(ProcessError::NotFound { program: cmd.program.clone() }),
                Script::ExitCode(code) => Err(ProcessError::Failed {
                    program: cmd.program.clone(),
                    status: format!("exit code: {code}"),
                    stderr: String::new(),
                }),
                Script::TimedOut => Err(ProcessError::TimedOut { program: cmd.program.clone(), timeout_ms: 5000 }),
            }
        }
    }

    fn resolver(scripts: &[(&'static str, Script)]) -> GpuResolver<ScriptedRunner> {
        GpuResolver::new(ScriptedRunner::new(scripts), SourceCommands::default())
    }

    fn assert_reading(r: &GpuReading, source: ReadingSource, fields: [&str; 4]) {
        assert_eq!(r.source(), source);
        assert_eq!([r.model(), r.total_memory(), r.used_memory(), r.utilization()], fields);
    }

    #[tokio::test]
    async fn nvidia_smi_line_is_used_verbatim() {
        let r = resolver(&[
            ("nvidia-smi", Script::Lines("RTX 4090, 24576 MiB, 1024 MiB, 15 %\n")),
            ("wmic", Script::Lines("Name  AdapterRAM\nOther GPU1073741824\n")),
        ]);
        let reading = r.resolve().await;
        assert_reading(
            &reading,
            ReadingSource::NvidiaSmi,
            ["RTX 4090", "24576 MiB", "1024 MiB", "15 %"],
        );
        assert_eq!(*r.runner.calls.borrow(), vec!["nvidia-smi"]);
    }

    #[tokio::test]
    async fn falls_back_to_wmic_when_nvidia_smi_is_missing() {
        let r = resolver(&[("wmic", Script::Lines("Name  AdapterRAM\nNVIDIA GeForce RTX 30901073741824\n"))]);
        let reading = r.resolve().await;
        assert_reading(&reading, ReadingSource::Wmic, ["NVIDIA GeForce RTX 3090", "1.0 GB", "N/A", "N/A"]);
        assert_eq!(*r.runner.calls.borrow(), vec!["nvidia-smi", "wmic"]);
    }

    #[tokio::test]
    async fn name_only_adapter_has_no_total_memory() {
        let r = resolver(&[("wmic", Script::Lines("Name\nIntel HD Graphics\n"))]);
        assert_reading(&r.resolve().await, ReadingSource::Wmic, ["Intel HD Graphics", "N/A", "N/A", "N/A"]);
    }

    #[tokio::test]
    async fn only_the_first_nvidia_line_counts() {
        let r = resolver(&[
            ("nvidia-smi", Script::Lines("garbage\nRTX 4090, 24576 MiB, 1024 MiB, 15 %\n")),
            ("wmic", Script::Lines("AdapterRAM  Name\n4293918720  NVIDIA GeForce GTX 1080\n")),
        ]);
        assert_reading(&r.resolve().await, ReadingSource::Wmic, ["NVIDIA GeForce GTX 1080", "4.0 GB", "N/A", "N/A"]);
    }

    #[tokio::test]
    async fn wrong_field_count_falls_back() {
        for out in ["RTX 4090, 24576 MiB, 15 %\n", "RTX 4090, 24576 MiB, 1024 MiB, 15 %, 60 C\n", "", ", 1, 2, 3"] {
            let r = resolver(&[("nvidia-smi", Script::Lines(out)), ("wmic", Script::Lines("Name\nIntel UHD Graphics 630\n"))]);
            assert_reading(&r.resolve().await, ReadingSource::Wmic, ["Intel UHD Graphics 630", "N/A", "N/A", "N/A"]);
        }
    }

    #[tokio::test]
    async fn failing_nvidia_smi_falls_back() {
        let r = resolver(&[
            ("nvidia-smi", Script::ExitCode(9)),
            ("wmic", Script::Lines("AdapterRAM  Name\n0           Microsoft Basic Display Adapter\n")),
        ]);
        assert_reading(
            &r.resolve().await,
            ReadingSource::Wmic,
            ["Microsoft Basic Display Adapter", "N/A", "N/A", "N/A"],
        );
    }

    #[tokio::test]
    async fn timed_out_nvidia_smi_falls_back_to_wmic() {
        let r = resolver(&[
            ("nvidia-smi", Script::TimedOut),
            ("wmic", Script::Lines("Name  AdapterRAM\nNVIDIA GeForce RTX 30901073741824\n")),
        ]);
        assert_reading(
            &r.resolve().await,
            ReadingSource::Wmic,
            ["NVIDIA GeForce RTX 3090", "1.0 GB", "N/A", "N/A"],
        );
        assert_eq!(*r.runner.calls.borrow(), vec!["nvidia-smi", "wmic"]);
    }

    #[tokio::test]
    async fn first_parsable_wmic_line_wins() {
        let r = resolver(&[(
            "wmic",
            Script::Lines("AdapterRAM  Name\n\n  \n2147483648  AMD Radeon RX 580\n1073741824  Intel UHD Graphics 630\n"),
        )]);
        assert_reading(&r.resolve().await, ReadingSource::Wmic, ["AMD Radeon RX 580", "2.0 GB", "N/A", "N/A"]);
    }

    #[tokio::test]
    async fn header_line_is_always_skipped() {
        let r = resolver(&[("wmic", Script::Lines("Intel HD Graphics\n"))]);
        assert_eq!(r.resolve().await, GpuReading::not_found());
    }

    #[tokio::test]
    async fn skip_patterns_move_to_next_adapter() {
        let r = resolver(&[(
            "wmic",
            Script::Lines("AdapterRAM  Name\n            Microsoft Basic Display Adapter\n4293918720  NVIDIA GeForce GTX 1080\n"),
        )])
        .with_skip_adapters(vec![Regex::new("^Microsoft Basic").unwrap()]);
        assert_reading(&r.resolve().await, ReadingSource::Wmic, ["NVIDIA GeForce GTX 1080", "4.0 GB", "N/A", "N/A"]);
    }

    #[tokio::test]
    async fn not_found_when_both_sources_fail() {
        let r = resolver(&[]);
        let reading = r.resolve().await;
        assert!(!reading.is_found());
        assert_reading(&reading, ReadingSource::NotFound, ["GPU not found!", "N/A", "N/A", "N/A"]);
        assert!(matches!(r.try_resolve().await, Err(ResolveError::NoGpuFound)));
    }

    #[tokio::test]
    async fn not_found_when_wmic_has_only_header() {
        let r = resolver(&[("nvidia-smi", Script::Lines("\n")), ("wmic", Script::Lines("AdapterRAM  Name\r\n\r\n"))]);
        assert_eq!(r.resolve().await, GpuReading::not_found());
    }

    #[tokio::test]
    async fn repeated_resolves_are_identical() {
        let r = resolver(&[("nvidia-smi", Script::Lines("RTX 4090, 24576 MiB, 1024 MiB, 15 %\n"))]);
        let first = r.resolve().await;
        let second = r.resolve().await;
        assert_eq!(first, second);

        let r = resolver(&[("wmic", Script::Lines("Name  AdapterRAM\nNVIDIA GeForce RTX 30901073741824\n"))]);
        assert_eq!(r.resolve().await, r.resolve().await);
    }

    #[test]
    fn commands_follow_config_paths() {
        let cfg = EffectiveConfig {
            nvidia_smi_path: "C:\\nv\\nvidia-smi.exe".into(),
            ..EffectiveConfig::default()
        };
        let commands = SourceCommands::from_config(&cfg);
        assert_eq!(
            commands.nvidia_smi.to_string(),
            "C:\\nv\\nvidia-smi.exe --query-gpu=name,memory.total,memory.used,utilization.gpu --format=csv,noheader"
        );
        assert_eq!(commands.wmic.to_string(), "wmic path win32_VideoController get Name,AdapterRAM");
    }

    #[test]
    fn parses_nvidia_line_fields() {
        let reading = parse_nvidia_line("  NVIDIA GeForce RTX 3060 ,12288 MiB,  512 MiB , 3 %  ").unwrap();
        assert_eq!(reading.model(), "NVIDIA GeForce RTX 3060");
        assert_eq!(reading.total_memory(), "12288 MiB");
        assert_eq!(reading.used_memory(), "512 MiB");
        assert_eq!(reading.utilization(), "3 %");
        assert!(parse_nvidia_line("No devices were found").is_none());
    }

    #[test]
    fn parses_adapter_line_layouts() {
        let cases: &[(&str, Option<(&str, Option<u64>)>)] = &[
            ("NVIDIA GeForce RTX 30901073741824", Some(("NVIDIA GeForce RTX 3090", Some(1073741824)))),
            ("Radeon Graphics536870912", Some(("Radeon Graphics", Some(536870912)))),
            ("NVIDIA GeForce GTX 1080    4293918720  \r", Some(("NVIDIA GeForce GTX 1080", Some(4293918720)))),
            ("4293918720  NVIDIA GeForce GTX 1080  ", Some(("NVIDIA GeForce GTX 1080", Some(4293918720)))),
            ("Intel UHD Graphics 630", Some(("Intel UHD Graphics 630", None))),
            ("Intel HD Graphics", Some(("Intel HD Graphics", None))),
            ("3dfx Voodoo3", Some(("3dfx Voodoo3", None))),
            ("3090  RTX", Some(("RTX", Some(3090)))),
            ("3090 Founders Edition", Some(("3090 Founders Edition", None))),
            ("NVIDIA GeForce GTX 1080 4293918720", Some(("NVIDIA GeForce GTX 1080", Some(4293918720)))),
            ("Radeon RX 5700 XT8589934592", Some(("Radeon RX 5700 XT8", Some(589934592)))),
            ("GPU  12884901888", Some(("GPU", None))),
            ("12884901888  GPU", Some(("GPU", None))),
            ("1073741824", None),
            ("   ", None),
        ];
        for (line, expected) in cases {
            let got = parse_adapter_line(line);
            let expected = expected.map(|(n, r)| (n.to_string(), r));
            assert_eq!(got, expected, "line {line:?}");
        }
    }

    #[test]
    fn oversized_ram_suffix_shrinks_to_fit_u32() {
        // 9999999999 overflows u32, so only nine digits are taken.
        assert_eq!(
            parse_adapter_line("GPU X19999999999"),
            Some(("GPU X19".to_string(), Some(999999999)))
        );
    }
}
