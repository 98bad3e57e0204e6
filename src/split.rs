use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate};

use crate::domain::{BoundingBox, DownloadTask, SplitGranularity, TaskKey};
use crate::error::TellusError;

pub fn build_tasks(
    variables: &[String],
    start: NaiveDate,
    end: NaiveDate,
    area: Option<BoundingBox>,
    hours: &[u8],
    split_by: SplitGranularity,
) -> Result<Vec<DownloadTask>, TellusError> {
    let spans = split_spans(start, end, split_by)?;
    Ok(spans
        .into_iter()
        .map(|(span_start, span_end)| {
            make_task(variables, span_start, span_end, area, hours, split_by)
        })
        .collect())
}

pub fn split_spans(
    start: NaiveDate,
    end: NaiveDate,
    split_by: SplitGranularity,
) -> Result<Vec<(NaiveDate, NaiveDate)>, TellusError> {
    if end < start {
        return Err(TellusError::InvalidRange {
            start: start.to_string(),
            end: end.to_string(),
        });
    }

    let mut spans = Vec::new();
    match split_by {
        SplitGranularity::Month => {
            let mut cursor = start;
            while cursor <= end {
                let span_end = end_of_month(cursor).min(end);
                spans.push((cursor, span_end));
                cursor = first_of_next_month(cursor);
            }
        }
        SplitGranularity::Year => {
            for year in start.year()..=end.year() {
                let year_start = NaiveDate::from_ymd_opt(year, 1, 1).unwrap_or(start);
                let year_end = NaiveDate::from_ymd_opt(year, 12, 31).unwrap_or(end);
                spans.push((year_start.max(start), year_end.min(end)));
            }
        }
        SplitGranularity::None => {
            spans.push((start, end));
        }
    }
    Ok(spans)
}

fn make_task(
    variables: &[String],
    start: NaiveDate,
    end: NaiveDate,
    area: Option<BoundingBox>,
    hours: &[u8],
    split_by: SplitGranularity,
) -> DownloadTask {
    let key = match split_by {
        SplitGranularity::Month => TaskKey::for_month(start.year(), start.month()),
        SplitGranularity::Year => TaskKey::for_year(start.year()),
        SplitGranularity::None => TaskKey::for_span(start, end),
    };

    let mut months = Vec::new();
    let mut days = BTreeSet::new();
    for date in start.iter_days().take_while(|date| *date <= end) {
        if !months.contains(&date.month()) {
            months.push(date.month());
        }
        days.insert(date.day());
    }

    DownloadTask {
        key,
        variables: variables.to_vec(),
        start,
        end,
        months,
        days: days.into_iter().collect(),
        hours: hours.to_vec(),
        area,
    }
}

fn end_of_month(date: NaiveDate) -> NaiveDate {
    first_of_next_month(date).pred_opt().unwrap_or(date)
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}
