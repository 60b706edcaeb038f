//! Run building: sort a drained buffer, collapse duplicate keys, split on
//! the partition prefix.

use crate::Result;
use reduce::MergeReducer;
use schema::{Record, Row};
use snafu::ResultExt;

/// Sorts `rows` by primary key and collapses equal-key neighbours through
/// `reducer` (raw path). The result is strictly increasing in key.
pub(crate) fn build_run(mut rows: Vec<Row>, reducer: &MergeReducer) -> Result<Vec<Record>> {
    rows.sort_by(|a, b| a.key.cmp(&b.key));

    let mut out: Vec<Record> = Vec::with_capacity(rows.len());
    let mut acc: Option<Record> = None;
    for row in &rows {
        match &mut acc {
            Some(current) if current.key == row.key => {
                reducer.on_next_row(current, row).context(crate::ReduceSnafu)?;
            }
            _ => {
                if let Some(done) = acc.take() {
                    out.push(reducer.finalise(done));
                }
                acc = Some(reducer.on_first_row(row).context(crate::ReduceSnafu)?);
            }
        }
    }
    if let Some(done) = acc.take() {
        out.push(reducer.finalise(done));
    }
    Ok(out)
}

/// Collapses equal-key neighbours of an already sorted record run
/// (pre-aggregated path).
pub(crate) fn reduce_sorted_records(
    records: Vec<Record>,
    reducer: &MergeReducer,
) -> Result<Vec<Record>> {
    let mut out: Vec<Record> = Vec::with_capacity(records.len());
    let mut acc: Option<Record> = None;
    for record in &records {
        match &mut acc {
            Some(current) if current.key == record.key => {
                reducer
                    .on_next_record(current, record)
                    .context(crate::ReduceSnafu)?;
            }
            _ => {
                if let Some(done) = acc.take() {
                    out.push(reducer.finalise(done));
                }
                acc = Some(reducer.on_first_record(record).context(crate::ReduceSnafu)?);
            }
        }
    }
    if let Some(done) = acc.take() {
        out.push(reducer.finalise(done));
    }
    Ok(out)
}

/// Splits a strictly-sorted run at every change of the leading
/// `prefix_len` key components. With `None` the run stays whole.
pub(crate) fn split_run(run: Vec<Record>, prefix_len: Option<usize>) -> Vec<Vec<Record>> {
    let prefix_len = match prefix_len {
        Some(len) => len,
        None => return if run.is_empty() { vec![] } else { vec![run] },
    };

    let mut parts: Vec<Vec<Record>> = vec![];
    for record in run {
        let start_new = parts.last().map_or(true, |part: &Vec<Record>| {
            part.last()
                .expect("parts are never empty")
                .key
                .cmp_prefix(&record.key, prefix_len)
                .is_ne()
        });
        if start_new {
            parts.push(vec![record]);
        } else {
            parts.last_mut().expect("just checked").push(record);
        }
    }
    parts
}
