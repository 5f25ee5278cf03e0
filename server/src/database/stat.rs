use std::collections::HashMap;

use diesel::dsl::{count_star, sql, sum};
use diesel::sql_types::{BigInt, Nullable};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::controller::BaseError;
use crate::database::{Db, DbResult};
use crate::schema::enum_def::UsageStatus;
use crate::schema::sqlite::usage_record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BucketSize {
    Minute,
    #[default]
    Hour,
    Day,
}

impl BucketSize {
    pub fn millis(&self) -> i64 {
        match self {
            BucketSize::Minute => 60_000,
            BucketSize::Hour => 3_600_000,
            BucketSize::Day => 86_400_000,
        }
    }

    /// Floors a UTC millisecond timestamp to the bucket boundary. Day
    /// buckets land on UTC midnights because the epoch is one.
    pub fn align(&self, ts_ms: i64) -> i64 {
        let width = self.millis();
        ts_ms - ts_ms.rem_euclid(width)
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct LeaderboardRow {
    pub key: String,
    pub request_count: i64,
    pub total_tokens: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub avg_response_ms: f64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct TimeBucket {
    pub bucket_start: i64,
    pub request_count: i64,
    pub total_tokens: i64,
    pub avg_response_ms: f64,
}

#[derive(Debug, Default, Serialize)]
pub struct UsageOverview {
    pub request_count: i64,
    pub total_tokens: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub avg_response_ms: f64,
    pub success_rate: f64,
}

#[derive(Debug, Queryable)]
struct UsageSlice {
    created_at: i64,
    client_ip: String,
    public_name: String,
    input_tokens: i32,
    output_tokens: i32,
    total_tokens: i32,
    response_time_ms: i64,
}

fn load_range(db: &Db, start_ms: i64, end_ms: i64) -> DbResult<Vec<UsageSlice>> {
    let conn = &mut db.conn()?;
    usage_record::table
        .filter(usage_record::created_at.ge(start_ms))
        .filter(usage_record::created_at.lt(end_ms))
        .select((
            usage_record::created_at,
            usage_record::client_ip,
            usage_record::public_name,
            usage_record::input_tokens,
            usage_record::output_tokens,
            usage_record::total_tokens,
            usage_record::response_time_ms,
        ))
        .order(usage_record::created_at.asc())
        .load::<UsageSlice>(conn)
        .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))
}

#[derive(Default)]
struct Accum {
    requests: i64,
    total: i64,
    input: i64,
    output: i64,
    response_ms: i64,
}

fn leaderboard<F>(db: &Db, start_ms: i64, end_ms: i64, limit: usize, key_of: F) -> DbResult<Vec<LeaderboardRow>>
where
    F: Fn(&UsageSlice) -> &str,
{
    let rows = load_range(db, start_ms, end_ms)?;
    let mut by_key: HashMap<String, Accum> = HashMap::new();
    for row in &rows {
        let acc = by_key.entry(key_of(row).to_string()).or_default();
        acc.requests += 1;
        acc.total += row.total_tokens as i64;
        acc.input += row.input_tokens as i64;
        acc.output += row.output_tokens as i64;
        acc.response_ms += row.response_time_ms;
    }

    let mut board: Vec<LeaderboardRow> = by_key
        .into_iter()
        .map(|(key, acc)| LeaderboardRow {
            key,
            request_count: acc.requests,
            total_tokens: acc.total,
            input_tokens: acc.input,
            output_tokens: acc.output,
            avg_response_ms: acc.response_ms as f64 / acc.requests as f64,
        })
        .collect();

    // tokens desc, then request count desc, then key for a stable tail
    board.sort_by(|a, b| {
        b.total_tokens
            .cmp(&a.total_tokens)
            .then(b.request_count.cmp(&a.request_count))
            .then(a.key.cmp(&b.key))
    });
    board.truncate(limit);
    Ok(board)
}

pub fn client_leaderboard(db: &Db, start_ms: i64, end_ms: i64, limit: usize) -> DbResult<Vec<LeaderboardRow>> {
    leaderboard(db, start_ms, end_ms, limit, |r| &r.client_ip)
}

pub fn model_leaderboard(db: &Db, start_ms: i64, end_ms: i64, limit: usize) -> DbResult<Vec<LeaderboardRow>> {
    leaderboard(db, start_ms, end_ms, limit, |r| &r.public_name)
}

/// Bucketed rollup across `[start, end)`. Buckets with no traffic are
/// emitted zeroed so the dashboard draws a continuous series.
pub fn time_buckets(db: &Db, start_ms: i64, end_ms: i64, size: BucketSize) -> DbResult<Vec<TimeBucket>> {
    let rows = load_range(db, start_ms, end_ms)?;

    let mut by_bucket: HashMap<i64, Accum> = HashMap::new();
    for row in &rows {
        let acc = by_bucket.entry(size.align(row.created_at)).or_default();
        acc.requests += 1;
        acc.total += row.total_tokens as i64;
        acc.response_ms += row.response_time_ms;
    }

    let mut series = Vec::new();
    let mut bucket = size.align(start_ms);
    while bucket < end_ms {
        match by_bucket.get(&bucket) {
            Some(acc) => series.push(TimeBucket {
                bucket_start: bucket,
                request_count: acc.requests,
                total_tokens: acc.total,
                avg_response_ms: acc.response_ms as f64 / acc.requests as f64,
            }),
            None => series.push(TimeBucket {
                bucket_start: bucket,
                request_count: 0,
                total_tokens: 0,
                avg_response_ms: 0.0,
            }),
        }
        bucket += size.millis();
    }
    Ok(series)
}

pub fn overview(db: &Db, start_ms: i64, end_ms: i64) -> DbResult<UsageOverview> {
    let conn = &mut db.conn()?;
    let in_range = || {
        usage_record::table
            .filter(usage_record::created_at.ge(start_ms))
            .filter(usage_record::created_at.lt(end_ms))
    };

    let request_count: i64 = in_range()
        .select(count_star())
        .first(conn)
        .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))?;
    if request_count == 0 {
        return Ok(UsageOverview::default());
    }

    let total_tokens: Option<i64> = in_range()
        .select(sum(usage_record::total_tokens))
        .first(conn)
        .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))?;
    let input_tokens: Option<i64> = in_range()
        .select(sum(usage_record::input_tokens))
        .first(conn)
        .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))?;
    let output_tokens: Option<i64> = in_range()
        .select(sum(usage_record::output_tokens))
        .first(conn)
        .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))?;
    // AVG() maps to a backend-dependent numeric type; sum and divide here
    // instead.
    let response_ms_sum: Option<i64> = in_range()
        .select(sql::<Nullable<BigInt>>("CAST(SUM(response_time_ms) AS BIGINT)"))
        .first(conn)
        .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))?;
    let successes: i64 = in_range()
        .filter(usage_record::status.eq(UsageStatus::Success))
        .select(count_star())
        .first(conn)
        .map_err(|e| BaseError::DatabaseFatal(Some(e.to_string())))?;

    Ok(UsageOverview {
        request_count,
        total_tokens: total_tokens.unwrap_or(0),
        input_tokens: input_tokens.unwrap_or(0),
        output_tokens: output_tokens.unwrap_or(0),
        avg_response_ms: response_ms_sum.unwrap_or(0) as f64 / request_count as f64,
        success_rate: successes as f64 * 100.0 / request_count as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::usage_record::{NewUsageRecord, UsageRecord};

    #[test]
    fn bucket_alignment_is_utc() {
        // 2024-05-01T12:34:56.789Z
        let ts = 1_714_566_896_789_i64;
        assert_eq!(BucketSize::Minute.align(ts) % 60_000, 0);
        assert_eq!(BucketSize::Hour.align(ts) % 3_600_000, 0);
        assert_eq!(BucketSize::Day.align(ts) % 86_400_000, 0);
        assert!(BucketSize::Day.align(ts) <= ts);
    }

    fn seeded_db(records: &[(i64, &str, &str, i32)]) -> (tempfile::TempDir, Db) {
        let tmp = tempfile::tempdir().unwrap();
        let db = Db::establish(&tmp.path().join("stats.db")).unwrap();
        let batch: Vec<NewUsageRecord> = records
            .iter()
            .map(|(ts, ip, model, tokens)| NewUsageRecord {
                id: uuid::Uuid::new_v4().to_string(),
                created_at: *ts,
                client_ip: ip.to_string(),
                public_name: model.to_string(),
                config_id: None,
                input_tokens: tokens / 2,
                output_tokens: tokens - tokens / 2,
                total_tokens: *tokens,
                response_time_ms: 100,
                status: UsageStatus::Success,
                error_message: None,
            })
            .collect();
        UsageRecord::insert_batch(&db, &batch).unwrap();
        (tmp, db)
    }

    #[test]
    fn leaderboard_tie_breaks_on_count_then_key() {
        // equal tokens: "b" has more requests than "c"; "a" ties "c" on
        // both and sorts lexicographically first
        let (_tmp, db) = seeded_db(&[
            (10, "b", "m", 50),
            (11, "b", "m", 50),
            (12, "c", "m", 100),
            (13, "a", "m", 100),
        ]);

        let board = client_leaderboard(&db, 0, 1_000, 10).unwrap();
        let keys: Vec<&str> = board.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(board[0].request_count, 2);
    }

    #[test]
    fn model_leaderboard_groups_by_public_name() {
        let (_tmp, db) = seeded_db(&[
            (10, "x", "gpt-4", 100),
            (11, "y", "gpt-4", 100),
            (12, "x", "claude", 300),
        ]);
        let board = model_leaderboard(&db, 0, 1_000, 10).unwrap();
        assert_eq!(board[0].key, "claude");
        assert_eq!(board[0].total_tokens, 300);
        assert_eq!(board[1].key, "gpt-4");
        assert_eq!(board[1].request_count, 2);
    }

    #[test]
    fn empty_buckets_are_emitted_zeroed() {
        let minute = 60_000;
        // traffic in minute 0 and minute 2, nothing in minute 1
        let (_tmp, db) = seeded_db(&[(0, "a", "m", 10), (2 * minute, "a", "m", 30)]);

        let series = time_buckets(&db, 0, 3 * minute, BucketSize::Minute).unwrap();
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].total_tokens, 10);
        assert_eq!(series[1].request_count, 0);
        assert_eq!(series[1].total_tokens, 0);
        assert_eq!(series[1].avg_response_ms, 0.0);
        assert_eq!(series[2].total_tokens, 30);
    }

    #[test]
    fn window_bounds_are_half_open() {
        let (_tmp, db) = seeded_db(&[(100, "a", "m", 10), (200, "a", "m", 20)]);
        let board = client_leaderboard(&db, 100, 200, 10).unwrap();
        assert_eq!(board[0].total_tokens, 10);
    }

    #[test]
    fn overview_totals_and_success_rate() {
        let (_tmp, db) = seeded_db(&[(10, "a", "m", 100), (20, "b", "m", 50)]);
        let stats = overview(&db, 0, 1_000).unwrap();
        assert_eq!(stats.request_count, 2);
        assert_eq!(stats.total_tokens, 150);
        assert_eq!(stats.input_tokens + stats.output_tokens, 150);
        assert_eq!(stats.avg_response_ms, 100.0);
        assert_eq!(stats.success_rate, 100.0);
    }
}
