// src/pipeline/staged.rs

//! Stage-by-stage analysis driver.
//!
//! Walks an [`AnalysisStages`] implementation through the fixed sequence
//!
//! 1. load the dataset (0.1 → 0.2 → 0.3)
//! 2. identify KPIs
//! 3. per KPI: analyze, visualize, derive insights
//! 4. summarize (0.9 → 0.95)
//! 5. render the report
//!
//! and publishes progress at every boundary. KPI `i` of `n` owns the band
//! `0.3 + 0.6·i/n .. 0.3 + 0.6·(i+1)/n`. A failing KPI stage is recorded in
//! that KPI's `error` field and the driver moves on to the next KPI; any other
//! failing stage fails the task.

use std::future::Future;
use std::pin::Pin;

use anyhow::Context as _;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::pipeline::{
    AnalysisPipeline, PipelineContext, PipelineFailure, PipelineOutcome, PipelineReport,
};
use crate::progress::ProgressUpdate;
use crate::task::{normalize_kpi, KpiField, KpiResult, PartialResults, RecordPatch};

/// Where the rendered artifacts of a run ended up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderedReport {
    pub report_ref: String,
    pub raw_data_ref: String,
}

/// The domain-specific steps of an analysis.
#[async_trait]
pub trait AnalysisStages: Send + Sync {
    /// Loaded dataset handed to every later stage.
    type Data: Send + Sync;

    async fn load(&self, task_id: &str, source_ref: &str) -> anyhow::Result<Self::Data>;

    async fn identify_kpis(&self, data: &Self::Data) -> anyhow::Result<Vec<String>>;

    /// Raw analysis of one KPI, passed on to visualization and insights.
    async fn analyze_kpi(&self, data: &Self::Data, kpi: &str) -> anyhow::Result<String>;

    /// Returns a reference to the rendered visualization.
    async fn visualize_kpi(
        &self,
        data: &Self::Data,
        kpi: &str,
        analysis: &str,
    ) -> anyhow::Result<String>;

    async fn kpi_insights(
        &self,
        kpi: &str,
        analysis: &str,
        visualization_ref: Option<&str>,
    ) -> anyhow::Result<String>;

    async fn summarize(&self, insights: &str) -> anyhow::Result<String>;

    async fn render_report(
        &self,
        task_id: &str,
        data: &Self::Data,
        results: &PartialResults,
        summary: &str,
    ) -> anyhow::Result<RenderedReport>;
}

#[derive(Debug, Clone)]
pub struct StagedPipeline<S> {
    stages: S,
}

impl<S: AnalysisStages> StagedPipeline<S> {
    pub fn new(stages: S) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &S {
        &self.stages
    }

    async fn drive(&self, ctx: &PipelineContext) -> anyhow::Result<PipelineReport> {
        ctx.report(ProgressUpdate::processing(0.1, "Starting analysis..."))
            .await;

        let data = self
            .stages
            .load(&ctx.task_id, &ctx.source_ref)
            .await
            .context("loading dataset")?;
        ctx.report(ProgressUpdate::processing(0.2, "Dataset loaded, preparing analysis..."))
            .await;
        ctx.report(ProgressUpdate::processing(0.3, "Data loaded, identifying KPIs..."))
            .await;

        let kpis = self
            .stages
            .identify_kpis(&data)
            .await
            .context("identifying KPIs")?;
        info!(task_id = %ctx.task_id, kpis = kpis.len(), "KPIs identified");
        ctx.report(
            ProgressUpdate::processing(0.3, format!("Identified {} KPIs", kpis.len()))
                .with_patch(RecordPatch::IdentifiedKpis(kpis.clone())),
        )
        .await;

        let mut results = PartialResults::new();
        let mut insights_all = String::new();
        let total = kpis.len();

        for (index, kpi) in kpis.iter().enumerate() {
            let band = 0.6 / total as f64;
            let base = 0.3 + band * index as f64;

            ctx.report(
                ProgressUpdate::processing(base, format!("Analyzing KPI: {kpi}"))
                    .with_patch(RecordPatch::CurrentKpi(Some(kpi.clone()))),
            )
            .await;

            let entry = results.entry(normalize_kpi(kpi)).or_default();
            match self.run_kpi(ctx, &data, kpi, base, band, entry).await {
                Ok(insights) => insights_all.push_str(&insights),
                Err(err) => {
                    warn!(task_id = %ctx.task_id, kpi = %kpi, error = %err, "KPI analysis failed; continuing");
                    let error = format!("{err:#}");
                    entry.error = Some(error.clone());
                    ctx.report(
                        ProgressUpdate::processing(
                            base + band,
                            format!("Failed to analyze KPI: {kpi}"),
                        )
                        .with_patch(RecordPatch::kpi(kpi.clone(), KpiField::Error, error)),
                    )
                    .await;
                }
            }
        }

        ctx.report(
            ProgressUpdate::processing(0.9, "Generating summary...")
                .with_patch(RecordPatch::CurrentKpi(None)),
        )
        .await;

        let summary = self
            .stages
            .summarize(&insights_all)
            .await
            .context("generating summary")?;
        ctx.report(
            ProgressUpdate::processing(0.95, "Summary generated, creating final report...")
                .with_patch(RecordPatch::Summary(summary.clone())),
        )
        .await;

        results.retain(|_, result: &mut KpiResult| !result.is_empty());
        let rendered = self
            .stages
            .render_report(&ctx.task_id, &data, &results, &summary)
            .await
            .context("rendering report")?;

        Ok(PipelineReport {
            report_ref: rendered.report_ref,
            raw_data_ref: rendered.raw_data_ref,
            summary: Some(summary),
        })
    }

    /// Analyze, visualize and explain one KPI. Returns the insights text.
    async fn run_kpi(
        &self,
        ctx: &PipelineContext,
        data: &S::Data,
        kpi: &str,
        base: f64,
        band: f64,
        entry: &mut KpiResult,
    ) -> anyhow::Result<String> {
        let analysis = self
            .stages
            .analyze_kpi(data, kpi)
            .await
            .with_context(|| format!("analyzing KPI '{kpi}'"))?;

        // A missing chart does not sink the KPI; insights can still be
        // derived from the raw analysis.
        let visualization = match self.stages.visualize_kpi(data, kpi, &analysis).await {
            Ok(reference) => {
                entry.visualization_ref = Some(reference.clone());
                ctx.report(
                    ProgressUpdate::processing(
                        base + band * 0.5,
                        format!("Generated visualization for: {kpi}"),
                    )
                    .with_patch(RecordPatch::kpi(
                        kpi,
                        KpiField::VisualizationRef,
                        reference.clone(),
                    )),
                )
                .await;
                Some(reference)
            }
            Err(err) => {
                warn!(task_id = %ctx.task_id, kpi, error = %err, "visualization failed; deriving insights without it");
                None
            }
        };

        let insights = self
            .stages
            .kpi_insights(kpi, &analysis, visualization.as_deref())
            .await
            .with_context(|| format!("deriving insights for KPI '{kpi}'"))?;
        entry.insights = Some(insights.clone());
        ctx.report(
            ProgressUpdate::processing(
                base + band,
                format!("Generated business insights for: {kpi}"),
            )
            .with_patch(RecordPatch::kpi(kpi, KpiField::Insights, insights.clone())),
        )
        .await;

        Ok(insights)
    }
}

impl<S: AnalysisStages> AnalysisPipeline for StagedPipeline<S> {
    fn run(
        &self,
        ctx: PipelineContext,
    ) -> Pin<Box<dyn Future<Output = PipelineOutcome> + Send + '_>> {
        Box::pin(async move {
            match self.drive(&ctx).await {
                Ok(report) => PipelineOutcome::Success(report),
                Err(err) => PipelineOutcome::Failure(PipelineFailure::from_error(&err)),
            }
        })
    }
}
