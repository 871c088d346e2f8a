//! Splitting one range query into grid-aligned sub-queries.
//!
//! The requested `[t0, t1]` range is cut into `batch_time`-sized pieces so
//! the sub-queries can run concurrently and be cached individually. Piece
//! boundaries snap to a global grid (`floor(t / batch_time) * batch_time`),
//! which makes identical absolute sub-ranges produce identical SQL — and
//! therefore identical cache keys — no matter which enclosing query they
//! came from.

use crate::{util, Result};

/// How close to `now` a sub-range may end before its SQL gets a taint
/// comment that keeps it out of stable cache entries.
const RECENT_WINDOW_MS: i64 = 60_000;

/// One planned sub-query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Fully expanded SQL, args and time condition substituted.
    pub sql: String,

    /// Left range edge, epoch milliseconds, inclusive.
    pub t0: i64,

    /// Right range edge, epoch milliseconds.
    pub t1: i64,

    /// Whether the right edge is `<=` (final batch) instead of `<`.
    pub right_inclusive: bool,

    /// Whether the range touches the last minute or the future; tainted
    /// batches never share a cache entry with stable historical ones.
    pub future_tainted: bool,
}

/// Substitute positional `?` placeholders by the single-quoted `args`, left
/// to right.
pub fn substitute_args(sql: &str, args: &[&str]) -> String {
    let mut sql = sql.to_string();
    for arg in args {
        util::replace_first(&mut sql, "?", &format!("'{arg}'"));
    }
    sql
}

/// Expand `sql` into one sub-query per `batch_time_ms` slice of the
/// inclusive `[time_range[0], time_range[1]]` interval.
///
/// Range edges are ISO-8601 strings; a date without a `T` means midnight
/// UTC. `now_ms` is the caller's wall clock, used only for the future
/// taint. An empty or backwards range plans zero batches.
pub fn plan(
    sql: &str,
    time_range: [&str; 2],
    args: &[&str],
    batch_time_ms: i64,
    now_ms: i64,
) -> Result<Vec<Batch>> {
    let a_min_ago = now_ms - RECENT_WINDOW_MS;

    let mut range = [time_range[0].to_string(), time_range[1].to_string()];
    for r in &mut range {
        if !r.contains('T') {
            r.push_str("T00:00:00.000Z");
        }
    }
    let t0 = util::parse_8601(&range[0])?;
    let t1 = util::parse_8601(&range[1])?;

    let fsql = substitute_args(sql, args);

    let batches = if t1 > t0 {
        (((t1 - t0) + batch_time_ms - 1) / batch_time_ms) as usize
    } else {
        0
    };

    let mut out = Vec::with_capacity(batches);
    for bi in 0..batches {
        let bt = align(t0 + batch_time_ms * bi as i64, batch_time_ms);
        let bt0 = if bi == 0 { t0 } else { bt };
        let last = bi == batches - 1;
        let bt1 = if last {
            t1
        } else {
            (bt + batch_time_ms).min(t1)
        };

        let mut eo = if last { "<=" } else { "<" }.to_string();

        // don't pollute the cache with results from queries into the
        // future (or near past)
        let future_tainted = bt1 >= a_min_ago;
        if future_tainted {
            eo += &format!("/*future!{a_min_ago}*/");
        }

        let mut bsql = fsql.clone();
        util::replace_first(
            &mut bsql,
            ":time_condition:",
            &format!(
                "(time >= '{}' AND time {} '{}')",
                util::to_8601(bt0),
                eo,
                util::to_8601(bt1)
            ),
        );

        out.push(Batch {
            sql: bsql,
            t0: bt0,
            t1: bt1,
            right_inclusive: last,
            future_tainted,
        });
    }

    Ok(out)
}

/// Snap `x` down to the global `b`-sized grid.
fn align(x: i64, b: i64) -> i64 {
    x.div_euclid(b) * b
}
