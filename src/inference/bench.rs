//! Benchmark parameters and report formatting

use std::fmt::Write;

/// Parameters for a native throughput benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchParams {
    /// Prompt tokens processed in one batch (`pp`)
    pub prompt_tokens: u32,
    /// Tokens generated one step at a time (`tg`)
    pub gen_tokens: u32,
    /// Sequences decoded in parallel during generation (`pl`)
    pub parallel: u32,
    /// Number of timed repetitions
    pub repetitions: u32,
}

impl BenchParams {
    /// Creates parameters with a single repetition.
    pub fn new(prompt_tokens: u32, gen_tokens: u32, parallel: u32) -> Self {
        Self {
            prompt_tokens,
            gen_tokens,
            parallel,
            repetitions: 1,
        }
    }

    pub fn with_repetitions(mut self, repetitions: u32) -> Self {
        self.repetitions = repetitions;
        self
    }

    /// Returns a description of the first out-of-range field, if any.
    pub fn check(&self) -> Option<&'static str> {
        if self.prompt_tokens == 0 {
            Some("prompt token count must be positive")
        } else if self.gen_tokens == 0 {
            Some("generated token count must be positive")
        } else if self.parallel == 0 {
            Some("parallel sequence count must be positive")
        } else if self.repetitions == 0 {
            Some("repetition count must be positive")
        } else {
            None
        }
    }
}

/// Model description shown in the first columns of a report.
#[derive(Debug, Clone)]
pub struct BenchModel {
    pub name: String,
    pub size_bytes: u64,
    pub param_count: u64,
    pub backend: String,
}

/// Returns mean and sample standard deviation; zero deviation for fewer than two samples.
pub fn mean_and_std(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    if samples.len() < 2 {
        return (mean, 0.0);
    }
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, variance.sqrt())
}

/// Formats prompt-processing and generation rates (tokens/s) as a markdown table.
pub fn format_report(
    model: &BenchModel,
    params: &BenchParams,
    pp_rates: &[f64],
    tg_rates: &[f64],
) -> String {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

    let size = model.size_bytes as f64 / GIB;
    let params_b = model.param_count as f64 / 1e9;
    let (pp_avg, pp_std) = mean_and_std(pp_rates);
    let (tg_avg, tg_std) = mean_and_std(tg_rates);

    let mut report = String::new();
    let _ = writeln!(report, "| model | size | params | backend | test | t/s |");
    let _ = writeln!(report, "| --- | --- | --- | --- | --- | --- |");
    let _ = writeln!(
        report,
        "| {} | {size:.2} GiB | {params_b:.2} B | {} | pp {} | {pp_avg:.2} ± {pp_std:.2} |",
        model.name, model.backend, params.prompt_tokens
    );
    let _ = writeln!(
        report,
        "| {} | {size:.2} GiB | {params_b:.2} B | {} | tg {} | {tg_avg:.2} ± {tg_std:.2} |",
        model.name, model.backend, params.gen_tokens
    );
    report
}
