//! llama.cpp timing output parser
//!
//! llama.cpp prints a timing summary on stderr when a run ends. Older builds
//! prefix it with `llama_print_timings`, newer ones with `llama_perf_*`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Performance metrics extracted from llama.cpp output
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlamaMetrics {
    pub load_time_ms: Option<f64>,
    /// Prompt evaluation time (time to first token)
    pub prompt_eval_time_ms: Option<f64>,
    pub prompt_tokens: Option<u32>,
    pub eval_time_ms: Option<f64>,
    /// Tokens generated
    pub eval_tokens: Option<u32>,
    /// Generation speed
    pub tokens_per_second: Option<f64>,
    pub total_time_ms: Option<f64>,
}

pub struct LlamaCppParser;

impl LlamaCppParser {
    /// Parse every timing line found in `output`
    ///
    /// ```text
    /// llama_print_timings:        load time =     123.45 ms
    /// llama_print_timings: prompt eval time =     234.56 ms /    10 tokens (   23.46 ms per token,    42.63 tokens per second)
    /// llama_print_timings:        eval time =    2000.00 ms /    49 runs   (   40.82 ms per token,    24.50 tokens per second)
    /// llama_print_timings:       total time =    2368.24 ms /    59 tokens
    /// ```
    pub fn parse(output: &str) -> LlamaMetrics {
        let mut metrics = LlamaMetrics::default();

        for line in output.lines().filter(|l| Self::is_timing_line(l)) {
            if line.contains("load time") {
                metrics.load_time_ms = extract_time_ms(line);
            } else if line.contains("prompt eval time") {
                metrics.prompt_eval_time_ms = extract_time_ms(line);
                metrics.prompt_tokens = extract_count(line, "tokens");
            } else if line.contains("eval time") {
                metrics.eval_time_ms = extract_time_ms(line);
                metrics.eval_tokens = extract_count(line, "runs");
                metrics.tokens_per_second = extract_tokens_per_second(line);
            } else if line.contains("total time") {
                metrics.total_time_ms = extract_time_ms(line);
            }
        }

        metrics
    }

    pub fn has_timing_info(output: &str) -> bool {
        output.lines().any(Self::is_timing_line)
    }

    fn is_timing_line(line: &str) -> bool {
        line.contains("llama_print_timings") || line.contains("llama_perf_")
    }
}

fn extract_time_ms(line: &str) -> Option<f64> {
    static TIME_REGEX: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"=\s+(\d+(?:\.\d+)?)\s*ms").expect("Invalid time regex"));

    TIME_REGEX
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn extract_tokens_per_second(line: &str) -> Option<f64> {
    static TPS_REGEX: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(\d+(?:\.\d+)?)\s+tokens per second").expect("Invalid tokens per second regex")
    });

    TPS_REGEX
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Count in "/ <n> runs" or "/ <n> tokens"
fn extract_count(line: &str, unit: &str) -> Option<u32> {
    static COUNT_REGEX: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"/\s+(\d+)\s+(runs|tokens)").expect("Invalid count regex"));

    COUNT_REGEX
        .captures(line)
        .filter(|caps| caps.get(2).is_some_and(|u| u.as_str() == unit))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY_OUTPUT: &str = "\
llama_print_timings:        load time =     123.45 ms
llama_print_timings:      sample time =      10.23 ms /    50 runs   (    0.20 ms per token,  4882.81 tokens per second)
llama_print_timings: prompt eval time =     234.56 ms /    10 tokens (   23.46 ms per token,    42.63 tokens per second)
llama_print_timings:        eval time =    2000.00 ms /    49 runs   (   40.82 ms per token,    24.50 tokens per second)
llama_print_timings:       total time =    2368.24 ms /    59 tokens
";

    const PERF_OUTPUT: &str = "\
llama_perf_sampler_print:    sampling time =       5.12 ms /    33 runs   (    0.16 ms per token,  6445.31 tokens per second)
llama_perf_context_print:        load time =     512.00 ms
llama_perf_context_print: prompt eval time =     120.00 ms /    18 tokens (    6.67 ms per token,   150.00 tokens per second)
llama_perf_context_print:        eval time =     800.00 ms /    32 runs   (   25.00 ms per token,    40.00 tokens per second)
llama_perf_context_print:       total time =     930.00 ms /    50 tokens
";

    #[test]
    fn test_parse_legacy_timings() {
        let metrics = LlamaCppParser::parse(LEGACY_OUTPUT);
        assert_eq!(metrics.load_time_ms, Some(123.45));
        assert_eq!(metrics.prompt_eval_time_ms, Some(234.56));
        assert_eq!(metrics.prompt_tokens, Some(10));
        assert_eq!(metrics.eval_tokens, Some(49));
        assert_eq!(metrics.tokens_per_second, Some(24.50));
        assert_eq!(metrics.total_time_ms, Some(2368.24));
    }

    #[test]
    fn test_parse_perf_timings() {
        let metrics = LlamaCppParser::parse(PERF_OUTPUT);
        assert_eq!(metrics.eval_tokens, Some(32));
        assert_eq!(metrics.tokens_per_second, Some(40.0));
        assert_eq!(metrics.prompt_tokens, Some(18));
    }

    #[test]
    fn test_no_timing_info() {
        let noise = "main: build = 1234\nHello there";
        assert!(!LlamaCppParser::has_timing_info(noise));
        assert_eq!(LlamaCppParser::parse(noise), LlamaMetrics::default());
        assert!(LlamaCppParser::has_timing_info(PERF_OUTPUT));
    }

    #[test]
    fn test_metrics_serialize() {
        let json = serde_json::to_value(LlamaCppParser::parse(PERF_OUTPUT)).unwrap();
        assert_eq!(json["eval_tokens"], 32);
        assert!(json["load_time_ms"].is_number());
    }

    #[test]
    fn test_count_unit_must_match() {
        let line = "llama_print_timings: eval time = 1.00 ms / 5 runs";
        assert_eq!(extract_count(line, "runs"), Some(5));
        assert_eq!(extract_count(line, "tokens"), None);
    }
}
