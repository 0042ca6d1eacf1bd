use std::fmt;

use serde::{Deserialize, Serialize};

/// A metric split by outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub total: f64,
    pub ok: f64,
    pub ko: f64,
}

/// A response time bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestGroup {
    pub name: String,
    pub count: u64,
    pub percentage: f64,
}

/// Decoded `js/global_stats.json` of a finished simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub number_of_requests: Execution,
    pub min_response_time: Execution,
    pub max_response_time: Execution,
    pub mean_response_time: Execution,
    pub standard_deviation: Execution,
    pub percentiles1: Execution,
    pub percentiles2: Execution,
    pub percentiles3: Execution,
    pub percentiles4: Execution,
    pub mean_number_of_requests_per_second: Execution,
    /// t < 800 ms
    #[serde(rename = "group1")]
    pub fast_requests: RequestGroup,
    /// 800 ms < t < 1200 ms
    #[serde(rename = "group2")]
    pub average_requests: RequestGroup,
    /// t > 1200 ms
    #[serde(rename = "group3")]
    pub slow_requests: RequestGroup,
    #[serde(rename = "group4")]
    pub failed_requests: RequestGroup,
}

impl SimulationResult {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl fmt::Display for SimulationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let requests = &self.number_of_requests;
        writeln!(
            f,
            "Requests:       {} (ok {}, ko {})",
            requests.total, requests.ok, requests.ko
        )?;
        writeln!(
            f,
            "Response time:  min {} / mean {} / max {} ms (std dev {})",
            self.min_response_time.total,
            self.mean_response_time.total,
            self.max_response_time.total,
            self.standard_deviation.total
        )?;
        writeln!(
            f,
            "Throughput:     {:.2} req/s",
            self.mean_number_of_requests_per_second.total
        )?;
        for group in [
            &self.fast_requests,
            &self.average_requests,
            &self.slow_requests,
            &self.failed_requests,
        ] {
            writeln!(
                f,
                "  {:<22} {:>6} ({}%)",
                group.name, group.count, group.percentage
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GLOBAL_STATS: &str = include_str!("../../tests/fixtures/global_stats.json");

    #[test]
    fn test_decode_global_stats() {
        let result = SimulationResult::from_json(GLOBAL_STATS).unwrap();

        assert_eq!(
            result.number_of_requests,
            Execution {
                total: 13.0,
                ok: 9.0,
                ko: 4.0
            }
        );
        assert_eq!(result.max_response_time.ok, 834.0);
        assert_eq!(result.percentiles4.total, 781.0);
        assert!((result.mean_number_of_requests_per_second.total - 4.1204).abs() < 1e-3);
        assert_eq!(result.fast_requests.name, "t < 800 ms");
        assert_eq!(result.fast_requests.count, 8);
        assert_eq!(result.average_requests.percentage, 8.0);
        assert_eq!(result.slow_requests.count, 0);
        assert_eq!(result.failed_requests.count, 4);
    }

    #[test]
    fn test_decode_rejects_incomplete_json() {
        assert!(SimulationResult::from_json("{}").is_err());
        assert!(SimulationResult::from_json("not json").is_err());
    }

    #[test]
    fn test_summary_mentions_groups() {
        let result = SimulationResult::from_json(GLOBAL_STATS).unwrap();
        let summary = result.to_string();
        assert!(summary.contains("Requests:       13 (ok 9, ko 4)"));
        assert!(summary.contains("failed"));
        assert!(summary.contains("4.12 req/s"));
    }
}
