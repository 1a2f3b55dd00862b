use tw_core::{AnalysisUsage, ApiCosts};

/// Per-unit prices in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostRates {
    pub per_search_query: f64,
    pub per_input_token: f64,
    pub per_output_token: f64,
}

impl Default for CostRates {
    fn default() -> Self {
        Self {
            per_search_query: 5.00 / 1_000.0,
            per_input_token: 2.50 / 1_000_000.0,
            per_output_token: 10.00 / 1_000_000.0,
        }
    }
}

/// Usage accumulated over one scan attempt. Recording never fails.
#[derive(Debug, Clone, Default)]
pub struct CostTracker {
    rates: CostRates,
    search_queries: u32,
    search_results: u32,
    input_tokens: u64,
    output_tokens: u64,
}

impl CostTracker {
    pub fn new(rates: CostRates) -> Self {
        Self {
            rates,
            ..Default::default()
        }
    }

    /// Every attempt is billed, including ones that failed.
    pub fn record_search(&mut self, attempts: usize, results: usize) {
        self.search_queries = self.search_queries.saturating_add(attempts as u32);
        self.search_results = self.search_results.saturating_add(results as u32);
    }

    pub fn record_analysis(&mut self, usage: AnalysisUsage) {
        self.input_tokens = self.input_tokens.saturating_add(usage.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(usage.output_tokens);
    }

    pub fn total_cost(&self) -> f64 {
        let raw = f64::from(self.search_queries) * self.rates.per_search_query
            + self.input_tokens as f64 * self.rates.per_input_token
            + self.output_tokens as f64 * self.rates.per_output_token;
        (raw * 1_000_000.0).round() / 1_000_000.0
    }

    pub fn finish(&self) -> ApiCosts {
        ApiCosts {
            search_queries: self.search_queries,
            search_results: self.search_results,
            analysis_units: self.input_tokens + self.output_tokens,
            analysis_input_tokens: self.input_tokens,
            analysis_output_tokens: self.output_tokens,
            total_cost: self.total_cost(),
        }
    }
}
