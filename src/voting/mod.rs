use crate::models::AggregateResults;

/// Who is ahead in the current results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Leader {
    /// No result rows yet.
    Pending,
    /// Several options share the highest count.
    Tie,
    Winner { option_id: i64, label: String },
}

// Per-option share of the total, ready for charting
#[derive(Debug, Clone, PartialEq)]
pub struct VoteShare {
    pub option_id: i64,
    pub label: String,
    pub count: u64,
    pub percent: f64,
}

pub struct ResultsSummary {
    pub shares: Vec<VoteShare>,
    pub summary: String,
}

/// Share of `count` in `total`, rounded to one decimal; 0 when nobody voted.
pub fn percent_of(count: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 * 1000.0 / total as f64).round() / 10.0
}

pub fn leader(results: &AggregateResults) -> Leader {
    let Some(max_count) = results.results.iter().map(|item| item.count).max() else {
        return Leader::Pending;
    };
    let mut top = results.results.iter().filter(|item| item.count == max_count);
    match (top.next(), top.next()) {
        (Some(item), None) => Leader::Winner {
            option_id: item.option_id,
            label: item.label.clone(),
        },
        _ => Leader::Tie,
    }
}

pub fn shares(results: &AggregateResults) -> Vec<VoteShare> {
    results
        .results
        .iter()
        .map(|item| VoteShare {
            option_id: item.option_id,
            label: item.label.clone(),
            count: item.count,
            percent: percent_of(item.count, results.total_votes),
        })
        .collect()
}

pub fn summarize(results: &AggregateResults, my_option: Option<i64>) -> ResultsSummary {
    let leader = leader(results);
    let shares = shares(results);

    let mut summary = String::new();
    match &leader {
        Leader::Pending => summary.push_str("Still counting.\n"),
        Leader::Tie => summary.push_str("Neck and neck!\n"),
        Leader::Winner { label, .. } => summary.push_str(&format!("Leading: {}\n", label)),
    }
    summary.push('\n');

    for share in &shares {
        let is_leader = matches!(&leader, Leader::Winner { option_id, .. } if *option_id == share.option_id);
        let marker = if my_option == Some(share.option_id) { "  <- your vote" } else { "" };
        let line = if is_leader {
            format!("**{}**: {} votes ({}%){}", share.label, share.count, share.percent, marker)
        } else {
            format!("{}: {} votes ({}%){}", share.label, share.count, share.percent, marker)
        };
        summary.push_str(&line);
        summary.push('\n');
    }

    summary.push_str(&format!("\n{} votes in total.", results.total_votes));

    ResultsSummary { shares, summary }
}
