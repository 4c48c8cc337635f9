use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use analysis_worker::pipeline::{AnalysisStages, RenderedReport};
use analysis_worker::task::PartialResults;

/// In-process analysis stages with configurable failures.
///
/// The loaded "dataset" is just the source ref. Every call is recorded as
/// `"<stage>:<kpi>"` (or just `"<stage>"`).
#[derive(Clone, Default)]
pub struct FakeStages {
    kpis: Vec<String>,
    fail_load: bool,
    failing_kpis: HashSet<String>,
    failing_charts: HashSet<String>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl FakeStages {
    pub fn new(kpis: &[&str]) -> Self {
        Self {
            kpis: kpis.iter().map(|k| k.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// Make the analysis step of `kpi` fail.
    pub fn failing_kpi(mut self, kpi: &str) -> Self {
        self.failing_kpis.insert(kpi.to_string());
        self
    }

    /// Make the visualization step of `kpi` fail.
    pub fn failing_chart(mut self, kpi: &str) -> Self {
        self.failing_charts.insert(kpi.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl AnalysisStages for FakeStages {
    type Data = String;

    async fn load(&self, _task_id: &str, source_ref: &str) -> anyhow::Result<String> {
        self.record("load".to_string());
        if self.fail_load {
            bail!("cannot read {source_ref}");
        }
        Ok(source_ref.to_string())
    }

    async fn identify_kpis(&self, _data: &String) -> anyhow::Result<Vec<String>> {
        self.record("identify".to_string());
        Ok(self.kpis.clone())
    }

    async fn analyze_kpi(&self, data: &String, kpi: &str) -> anyhow::Result<String> {
        self.record(format!("analyze:{kpi}"));
        if self.failing_kpis.contains(kpi) {
            return Err(anyhow!("generated code for {kpi} raised an error"));
        }
        Ok(format!("analysis of {kpi} over {data}"))
    }

    async fn visualize_kpi(
        &self,
        _data: &String,
        kpi: &str,
        _analysis: &str,
    ) -> anyhow::Result<String> {
        self.record(format!("visualize:{kpi}"));
        if self.failing_charts.contains(kpi) {
            bail!("chart rendering failed for {kpi}");
        }
        Ok(format!("chart://{}", kpi.to_lowercase()))
    }

    async fn kpi_insights(
        &self,
        kpi: &str,
        _analysis: &str,
        visualization_ref: Option<&str>,
    ) -> anyhow::Result<String> {
        self.record(format!("insights:{kpi}"));
        Ok(match visualization_ref {
            Some(chart) => format!("{kpi} looks healthy (see {chart}). "),
            None => format!("{kpi} looks healthy. "),
        })
    }

    async fn summarize(&self, insights: &str) -> anyhow::Result<String> {
        self.record("summarize".to_string());
        Ok(format!("summary: {}", insights.trim()))
    }

    async fn render_report(
        &self,
        task_id: &str,
        _data: &String,
        results: &PartialResults,
        _summary: &str,
    ) -> anyhow::Result<RenderedReport> {
        self.record(format!("render:{}", results.len()));
        Ok(RenderedReport {
            report_ref: format!("report://{task_id}.html"),
            raw_data_ref: format!("raw://{task_id}.json"),
        })
    }
}
