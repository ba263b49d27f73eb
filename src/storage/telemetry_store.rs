// Append-oriented store for traces, observations, scores and artifacts.
//
// Rows carry a partition_date column derived from their start time; the
// retention sweep deletes whole partitions. Upserts are replacing merges by
// primary key, so readers may transiently see either version of a row.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, QueryBuilder, Sqlite};
use std::collections::HashMap;
use tracing::debug;

use crate::domain::{
    AgentArtifact, MetricKind, Observation, Result, Score, Trace, TraceLevel,
};

use super::models::{
    encode_score_value, ArtifactRow, ObservationRow, ScoreRow, TraceRow,
};

/// Rows are chunked so a single statement stays well under SQLite's bind
/// variable limit.
const INSERT_CHUNK_ROWS: usize = 250;

/// Destination table for a buffered write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryTable {
    Traces,
    Observations,
    Scores,
    Artifacts,
}

impl TelemetryTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryTable::Traces => "traces",
            TelemetryTable::Observations => "observations",
            TelemetryTable::Scores => "scores",
            TelemetryTable::Artifacts => "artifacts",
        }
    }

    pub const ALL: [TelemetryTable; 4] = [
        TelemetryTable::Traces,
        TelemetryTable::Observations,
        TelemetryTable::Scores,
        TelemetryTable::Artifacts,
    ];
}

/// One unit of work handed to the batcher. Serializable so a failed flush
/// can be parked on the durable queue and replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum TelemetryWrite {
    Trace(Trace),
    Observation(Observation),
    Score(Score),
    Artifact(AgentArtifact),
}

impl TelemetryWrite {
    pub fn table(&self) -> TelemetryTable {
        match self {
            TelemetryWrite::Trace(_) => TelemetryTable::Traces,
            TelemetryWrite::Observation(_) => TelemetryTable::Observations,
            TelemetryWrite::Score(_) => TelemetryTable::Scores,
            TelemetryWrite::Artifact(_) => TelemetryTable::Artifacts,
        }
    }
}

/// Filters for the trace listing endpoint.
#[derive(Debug, Clone, Default)]
pub struct TraceFilter {
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub level: Option<TraceLevel>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub min_cost: Option<f64>,
    pub max_cost: Option<f64>,
    pub min_latency_ms: Option<i64>,
    pub max_latency_ms: Option<i64>,
}

/// Keyset cursor position: rows strictly older than this are returned.
#[derive(Debug, Clone)]
pub struct CursorPosition {
    pub id: String,
    pub ts: DateTime<Utc>,
}

/// One point of a materialized metric window.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub bucket: i64,
    pub value: f64,
}

/// Aggregation output for a time bucket.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateBucket {
    pub bucket_start: i64,
    pub count: u64,
    pub sum: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

fn partition_date(at: DateTime<Utc>) -> String {
    at.date_naive().format("%Y-%m-%d").to_string()
}

fn json_opt(value: &Option<serde_json::Value>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(Into::into))
        .transpose()
}

#[derive(Clone)]
pub struct TelemetryStore {
    pool: Pool<Sqlite>,
}

impl TelemetryStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Insert a homogeneous batch. The batcher guarantees writes for a given
    /// table are serialized through a single flusher.
    pub async fn insert_batch(&self, writes: &[TelemetryWrite]) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }

        let mut traces = Vec::new();
        let mut observations = Vec::new();
        let mut scores = Vec::new();
        let mut artifacts = Vec::new();
        for write in writes {
            match write {
                TelemetryWrite::Trace(t) => traces.push(t),
                TelemetryWrite::Observation(o) => observations.push(o),
                TelemetryWrite::Score(s) => scores.push(s),
                TelemetryWrite::Artifact(a) => artifacts.push(a),
            }
        }

        if !traces.is_empty() {
            self.upsert_traces(&traces).await?;
        }
        if !observations.is_empty() {
            self.upsert_observations(&observations).await?;
        }
        if !scores.is_empty() {
            self.upsert_scores(&scores).await?;
        }
        if !artifacts.is_empty() {
            self.insert_artifacts(&artifacts).await?;
        }

        debug!(rows = writes.len(), "Telemetry batch inserted");
        Ok(())
    }

    async fn upsert_traces(&self, traces: &[&Trace]) -> Result<()> {
        for chunk in traces.chunks(INSERT_CHUNK_ROWS) {
            let rows: Vec<_> = chunk
                .iter()
                .map(|t| {
                    Ok((
                        t,
                        json_opt(&t.input)?,
                        json_opt(&t.output)?,
                        serde_json::to_string(&t.tags)?,
                        serde_json::to_string(&t.metadata)?,
                    ))
                })
                .collect::<Result<_>>()?;
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO traces (project_id, id, name, session_id, user_id, start_time, \
                 end_time, input, output, tags, metadata, level, partition_date, received_at) ",
            );
            qb.push_values(rows, |mut b, (t, input, output, tags, metadata)| {
                b.push_bind(&t.project_id)
                    .push_bind(&t.id)
                    .push_bind(&t.name)
                    .push_bind(&t.session_id)
                    .push_bind(&t.user_id)
                    .push_bind(t.start_time)
                    .push_bind(t.end_time)
                    .push_bind(input)
                    .push_bind(output)
                    .push_bind(tags)
                    .push_bind(metadata)
                    .push_bind(t.level.as_str())
                    .push_bind(partition_date(t.start_time))
                    .push_bind(t.received_at);
            });
            qb.push(
                " ON CONFLICT(project_id, id) DO UPDATE SET \
                 name = COALESCE(excluded.name, name), \
                 session_id = COALESCE(excluded.session_id, session_id), \
                 user_id = COALESCE(excluded.user_id, user_id), \
                 end_time = COALESCE(excluded.end_time, end_time), \
                 input = COALESCE(excluded.input, input), \
                 output = COALESCE(excluded.output, output), \
                 tags = CASE WHEN excluded.tags != '[]' THEN excluded.tags ELSE tags END, \
                 metadata = CASE WHEN excluded.metadata != 'null' THEN excluded.metadata ELSE metadata END, \
                 level = CASE WHEN excluded.level != 'default' THEN excluded.level ELSE level END, \
                 received_at = excluded.received_at",
            );
            qb.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn upsert_observations(&self, observations: &[&Observation]) -> Result<()> {
        for chunk in observations.chunks(INSERT_CHUNK_ROWS) {
            let rows: Vec<_> = chunk
                .iter()
                .map(|o| {
                    Ok((
                        o,
                        json_opt(&o.input)?,
                        json_opt(&o.output)?,
                        serde_json::to_string(&o.metadata)?,
                    ))
                })
                .collect::<Result<_>>()?;
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO observations (project_id, id, trace_id, parent_id, observation_type, \
                 name, model, provider, input_tokens, output_tokens, cache_read_tokens, cost, \
                 cost_calculated, last_calculated_at, start_time, end_time, input, output, \
                 metadata, partition_date, received_at) ",
            );
            qb.push_values(rows, |mut b, (o, input, output, metadata)| {
                b.push_bind(&o.project_id)
                    .push_bind(&o.id)
                    .push_bind(&o.trace_id)
                    .push_bind(&o.parent_id)
                    .push_bind(o.observation_type.as_str())
                    .push_bind(&o.name)
                    .push_bind(&o.model)
                    .push_bind(&o.provider)
                    .push_bind(o.input_tokens as i64)
                    .push_bind(o.output_tokens as i64)
                    .push_bind(o.cache_read_tokens as i64)
                    .push_bind(o.cost.map(|c| c.to_string()))
                    .push_bind(o.cost_calculated as i64)
                    .push_bind(o.last_calculated_at)
                    .push_bind(o.start_time)
                    .push_bind(o.end_time)
                    .push_bind(input)
                    .push_bind(output)
                    .push_bind(metadata)
                    .push_bind(partition_date(o.start_time))
                    .push_bind(o.received_at);
            });
            qb.push(
                " ON CONFLICT(project_id, id) DO UPDATE SET \
                 parent_id = COALESCE(excluded.parent_id, parent_id), \
                 name = COALESCE(excluded.name, name), \
                 model = COALESCE(excluded.model, model), \
                 provider = COALESCE(excluded.provider, provider), \
                 input_tokens = CASE WHEN excluded.input_tokens > 0 THEN excluded.input_tokens ELSE input_tokens END, \
                 output_tokens = CASE WHEN excluded.output_tokens > 0 THEN excluded.output_tokens ELSE output_tokens END, \
                 cache_read_tokens = CASE WHEN excluded.cache_read_tokens > 0 THEN excluded.cache_read_tokens ELSE cache_read_tokens END, \
                 end_time = COALESCE(excluded.end_time, end_time), \
                 input = COALESCE(excluded.input, input), \
                 output = COALESCE(excluded.output, output), \
                 metadata = CASE WHEN excluded.metadata != 'null' THEN excluded.metadata ELSE metadata END, \
                 received_at = excluded.received_at",
            );
            qb.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Score replays with the same id are idempotent.
    async fn upsert_scores(&self, scores: &[&Score]) -> Result<()> {
        for chunk in scores.chunks(INSERT_CHUNK_ROWS) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO scores (id, project_id, trace_id, observation_id, name, value, \
                 data_type, source, comment, evaluator_id, partition_date, created_at) ",
            );
            qb.push_values(chunk, |mut b, s| {
                b.push_bind(&s.id)
                    .push_bind(&s.project_id)
                    .push_bind(&s.trace_id)
                    .push_bind(&s.observation_id)
                    .push_bind(&s.name)
                    .push_bind(encode_score_value(&s.value))
                    .push_bind(s.data_type.as_str())
                    .push_bind(s.source.as_str())
                    .push_bind(&s.comment)
                    .push_bind(s.evaluator_id.as_ref().map(|id| id.to_string()))
                    .push_bind(partition_date(s.created_at))
                    .push_bind(s.created_at);
            });
            qb.push(
                " ON CONFLICT(id) DO UPDATE SET \
                 value = excluded.value, \
                 comment = COALESCE(excluded.comment, comment), \
                 created_at = excluded.created_at",
            );
            qb.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert_artifacts(&self, artifacts: &[&AgentArtifact]) -> Result<()> {
        for chunk in artifacts.chunks(INSERT_CHUNK_ROWS) {
            let rows: Vec<_> = chunk
                .iter()
                .map(|a| Ok((a, serde_json::to_string(&a.payload)?)))
                .collect::<Result<_>>()?;
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO artifacts (id, project_id, trace_id, observation_id, kind, payload, \
                 partition_date, created_at) ",
            );
            qb.push_values(rows, |mut b, (a, payload)| {
                b.push_bind(&a.id)
                    .push_bind(&a.project_id)
                    .push_bind(&a.trace_id)
                    .push_bind(&a.observation_id)
                    .push_bind(a.kind.as_str())
                    .push_bind(payload)
                    .push_bind(partition_date(a.created_at))
                    .push_bind(a.created_at);
            });
            qb.push(" ON CONFLICT(id) DO NOTHING");
            qb.build().execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn insert_score(&self, score: &Score) -> Result<()> {
        self.upsert_scores(&[score]).await
    }

    // ---- point reads ----

    pub async fn get_trace(&self, project_id: &str, id: &str) -> Result<Option<Trace>> {
        let row = sqlx::query_as::<_, TraceRow>(
            "SELECT * FROM traces WHERE project_id = ? AND id = ?",
        )
        .bind(project_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Trace::try_from).transpose()
    }

    pub async fn get_observation(
        &self,
        project_id: &str,
        id: &str,
    ) -> Result<Option<Observation>> {
        let row = sqlx::query_as::<_, ObservationRow>(
            "SELECT * FROM observations WHERE project_id = ? AND id = ?",
        )
        .bind(project_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Observation::try_from).transpose()
    }

    /// Mark a trace complete. The stored end time never moves backwards past
    /// the latest observation end already recorded.
    pub async fn complete_trace(
        &self,
        project_id: &str,
        id: &str,
        end_time: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE traces SET end_time = ? WHERE project_id = ? AND id = ?",
        )
        .bind(end_time)
        .bind(project_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- cost pipeline support ----

    pub async fn set_observation_cost(
        &self,
        project_id: &str,
        id: &str,
        cost: Decimal,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE observations SET cost = ?, cost_calculated = 1, last_calculated_at = ? \
             WHERE project_id = ? AND id = ?",
        )
        .bind(cost.to_string())
        .bind(at)
        .bind(project_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Observations whose cost still needs (re)computation, oldest first.
    pub async fn observations_for_recompute(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Observation>> {
        let rows = sqlx::query_as::<_, ObservationRow>(
            r#"
            SELECT * FROM observations
            WHERE project_id = ? AND start_time >= ? AND model IS NOT NULL
            ORDER BY start_time ASC
            LIMIT ?
            "#,
        )
        .bind(project_id)
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Observation::try_from).collect()
    }

    // ---- listing & dataloaders ----

    pub async fn list_traces(
        &self,
        project_id: &str,
        filter: &TraceFilter,
        cursor: Option<&CursorPosition>,
        limit: u32,
    ) -> Result<Vec<Trace>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM traces t WHERE t.project_id = ");
        qb.push_bind(project_id);

        if let Some(name) = &filter.name {
            qb.push(" AND t.name = ").push_bind(name);
        }
        for tag in &filter.tags {
            qb.push(" AND EXISTS (SELECT 1 FROM json_each(t.tags) WHERE value = ")
                .push_bind(tag)
                .push(")");
        }
        if let Some(from) = filter.from {
            qb.push(" AND t.start_time >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            qb.push(" AND t.start_time <= ").push_bind(to);
        }
        if let Some(level) = filter.level {
            qb.push(" AND t.level = ").push_bind(level.as_str());
        }
        if let Some(user_id) = &filter.user_id {
            qb.push(" AND t.user_id = ").push_bind(user_id);
        }
        if let Some(session_id) = &filter.session_id {
            qb.push(" AND t.session_id = ").push_bind(session_id);
        }
        if filter.min_cost.is_some() || filter.max_cost.is_some() {
            qb.push(
                " AND (SELECT COALESCE(SUM(CAST(o.cost AS REAL)), 0.0) FROM observations o \
                 WHERE o.project_id = t.project_id AND o.trace_id = t.id)",
            );
            if let Some(min) = filter.min_cost {
                qb.push(" >= ").push_bind(min);
            }
            if let Some(max) = filter.max_cost {
                if filter.min_cost.is_some() {
                    qb.push(
                        " AND (SELECT COALESCE(SUM(CAST(o.cost AS REAL)), 0.0) FROM observations o \
                         WHERE o.project_id = t.project_id AND o.trace_id = t.id)",
                    );
                }
                qb.push(" <= ").push_bind(max);
            }
        }
        if let Some(min) = filter.min_latency_ms {
            qb.push(
                " AND t.end_time IS NOT NULL AND \
                 (julianday(t.end_time) - julianday(t.start_time)) * 86400000 >= ",
            )
            .push_bind(min as f64);
        }
        if let Some(max) = filter.max_latency_ms {
            qb.push(
                " AND t.end_time IS NOT NULL AND \
                 (julianday(t.end_time) - julianday(t.start_time)) * 86400000 <= ",
            )
            .push_bind(max as f64);
        }
        if let Some(cursor) = cursor {
            qb.push(" AND (t.start_time < ")
                .push_bind(cursor.ts)
                .push(" OR (t.start_time = ")
                .push_bind(cursor.ts)
                .push(" AND t.id < ")
                .push_bind(&cursor.id)
                .push("))");
        }
        qb.push(" ORDER BY t.start_time DESC, t.id DESC LIMIT ")
            .push_bind(limit as i64);

        let rows: Vec<TraceRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Trace::try_from).collect()
    }

    /// Batched loader: observations for many traces in one round trip.
    pub async fn observations_for_traces(
        &self,
        project_id: &str,
        trace_ids: &[String],
    ) -> Result<HashMap<String, Vec<Observation>>> {
        if trace_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM observations WHERE project_id = ");
        qb.push_bind(project_id);
        qb.push(" AND trace_id IN (");
        let mut separated = qb.separated(", ");
        for id in trace_ids {
            separated.push_bind(id);
        }
        qb.push(") ORDER BY start_time ASC");

        let rows: Vec<ObservationRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let mut grouped: HashMap<String, Vec<Observation>> = HashMap::new();
        for row in rows {
            let obs = Observation::try_from(row)?;
            grouped.entry(obs.trace_id.clone()).or_default().push(obs);
        }
        Ok(grouped)
    }

    /// Batched loader: scores grouped by trace.
    pub async fn scores_for_traces(
        &self,
        project_id: &str,
        trace_ids: &[String],
    ) -> Result<HashMap<String, Vec<Score>>> {
        if trace_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM scores WHERE project_id = ");
        qb.push_bind(project_id);
        qb.push(" AND trace_id IN (");
        let mut separated = qb.separated(", ");
        for id in trace_ids {
            separated.push_bind(id);
        }
        qb.push(") ORDER BY created_at ASC");

        let rows: Vec<ScoreRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let mut grouped: HashMap<String, Vec<Score>> = HashMap::new();
        for row in rows {
            let score = Score::try_from(row)?;
            grouped
                .entry(score.trace_id.clone())
                .or_default()
                .push(score);
        }
        Ok(grouped)
    }

    /// Batched loader: artifacts grouped by trace.
    pub async fn artifacts_for_traces(
        &self,
        project_id: &str,
        trace_ids: &[String],
    ) -> Result<HashMap<String, Vec<AgentArtifact>>> {
        if trace_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM artifacts WHERE project_id = ");
        qb.push_bind(project_id);
        qb.push(" AND trace_id IN (");
        let mut separated = qb.separated(", ");
        for id in trace_ids {
            separated.push_bind(id);
        }
        qb.push(") ORDER BY created_at ASC");

        let rows: Vec<ArtifactRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let mut grouped: HashMap<String, Vec<AgentArtifact>> = HashMap::new();
        for row in rows {
            let artifact = AgentArtifact::try_from(row)?;
            grouped
                .entry(artifact.trace_id.clone())
                .or_default()
                .push(artifact);
        }
        Ok(grouped)
    }

    pub async fn scores_for_trace(&self, project_id: &str, trace_id: &str) -> Result<Vec<Score>> {
        let grouped = self
            .scores_for_traces(project_id, &[trace_id.to_string()])
            .await?;
        Ok(grouped.into_values().next().unwrap_or_default())
    }

    // ---- metric windows & aggregation ----

    /// Materialize a per-minute metric window for the anomaly detector,
    /// ordered oldest first.
    pub async fn metric_window(
        &self,
        project_id: &str,
        metric: MetricKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricPoint>> {
        let sql = match metric {
            MetricKind::Latency => {
                r#"
                SELECT (CAST(strftime('%s', start_time) AS INTEGER) / 60) * 60 AS bucket,
                       AVG((julianday(end_time) - julianday(start_time)) * 86400000.0) AS value
                FROM observations
                WHERE project_id = ? AND start_time >= ? AND start_time <= ?
                  AND end_time IS NOT NULL
                GROUP BY bucket ORDER BY bucket ASC
                "#
            }
            MetricKind::Cost => {
                r#"
                SELECT (CAST(strftime('%s', start_time) AS INTEGER) / 60) * 60 AS bucket,
                       SUM(COALESCE(CAST(cost AS REAL), 0.0)) AS value
                FROM observations
                WHERE project_id = ? AND start_time >= ? AND start_time <= ?
                GROUP BY bucket ORDER BY bucket ASC
                "#
            }
            MetricKind::Tokens => {
                r#"
                SELECT (CAST(strftime('%s', start_time) AS INTEGER) / 60) * 60 AS bucket,
                       CAST(SUM(input_tokens + output_tokens) AS REAL) AS value
                FROM observations
                WHERE project_id = ? AND start_time >= ? AND start_time <= ?
                GROUP BY bucket ORDER BY bucket ASC
                "#
            }
            MetricKind::ErrorRate => {
                r#"
                SELECT (CAST(strftime('%s', start_time) AS INTEGER) / 60) * 60 AS bucket,
                       AVG(CASE WHEN level = 'error' THEN 1.0 ELSE 0.0 END) AS value
                FROM traces
                WHERE project_id = ? AND start_time >= ? AND start_time <= ?
                GROUP BY bucket ORDER BY bucket ASC
                "#
            }
        };

        let rows: Vec<(i64, f64)> = sqlx::query_as(sql)
            .bind(project_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(bucket, value)| MetricPoint { bucket, value })
            .collect())
    }

    /// Count/sum/percentiles over fixed time buckets. Percentiles are
    /// computed in-process from the bucketed raw values.
    pub async fn aggregate_metric(
        &self,
        project_id: &str,
        metric: MetricKind,
        bucket_secs: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AggregateBucket>> {
        let bucket_secs = bucket_secs.max(1);
        let sql = match metric {
            MetricKind::Latency => {
                "SELECT CAST(strftime('%s', start_time) AS INTEGER) AS ts, \
                 (julianday(end_time) - julianday(start_time)) * 86400000.0 AS value \
                 FROM observations \
                 WHERE project_id = ? AND start_time >= ? AND start_time <= ? AND end_time IS NOT NULL"
            }
            MetricKind::Cost => {
                "SELECT CAST(strftime('%s', start_time) AS INTEGER) AS ts, \
                 COALESCE(CAST(cost AS REAL), 0.0) AS value \
                 FROM observations \
                 WHERE project_id = ? AND start_time >= ? AND start_time <= ?"
            }
            MetricKind::Tokens => {
                "SELECT CAST(strftime('%s', start_time) AS INTEGER) AS ts, \
                 CAST(input_tokens + output_tokens AS REAL) AS value \
                 FROM observations \
                 WHERE project_id = ? AND start_time >= ? AND start_time <= ?"
            }
            MetricKind::ErrorRate => {
                "SELECT CAST(strftime('%s', start_time) AS INTEGER) AS ts, \
                 CASE WHEN level = 'error' THEN 1.0 ELSE 0.0 END AS value \
                 FROM traces \
                 WHERE project_id = ? AND start_time >= ? AND start_time <= ?"
            }
        };

        let rows: Vec<(i64, f64)> = sqlx::query_as(sql)
            .bind(project_id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;

        let mut buckets: HashMap<i64, Vec<f64>> = HashMap::new();
        for (ts, value) in rows {
            let bucket = (ts / bucket_secs) * bucket_secs;
            buckets.entry(bucket).or_default().push(value);
        }

        let mut out: Vec<AggregateBucket> = buckets
            .into_iter()
            .map(|(bucket_start, mut values)| {
                values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let sum = values.iter().sum();
                AggregateBucket {
                    bucket_start,
                    count: values.len() as u64,
                    sum,
                    p50: percentile(&values, 0.50),
                    p95: percentile(&values, 0.95),
                    p99: percentile(&values, 0.99),
                }
            })
            .collect();
        out.sort_by_key(|b| b.bucket_start);
        Ok(out)
    }

    // ---- retention ----

    /// Drop all partitions strictly older than the cutoff date for a
    /// project. Returns total rows removed.
    pub async fn drop_partitions_before(
        &self,
        project_id: &str,
        cutoff: NaiveDate,
    ) -> Result<u64> {
        let cutoff = cutoff.format("%Y-%m-%d").to_string();
        let mut total = 0u64;
        for table in TelemetryTable::ALL {
            let sql = format!(
                "DELETE FROM {} WHERE project_id = ? AND partition_date < ?",
                table.as_str()
            );
            let result = sqlx::query(&sql)
                .bind(project_id)
                .bind(&cutoff)
                .execute(&self.pool)
                .await?;
            total += result.rows_affected();
        }
        debug!(project_id, cutoff, rows = total, "Retention partitions dropped");
        Ok(total)
    }
}

/// Nearest-rank percentile over pre-sorted values.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((q * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}
