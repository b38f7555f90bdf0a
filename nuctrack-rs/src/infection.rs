//! Heuristic infection calls.
//!
//! Cells are weakly labeled by an Otsu split of the mean marker intensity
//! and a random forest is fit to those labels using morphology and mean
//! intensities. Neither column is ground truth.

use clap::Args;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::forest::{ForestParams, RandomForest};
use crate::stats::StatsTable;
use crate::threshold;

const SHAPE_FEATURES: [&str; 4] = ["area", "centroid-0", "centroid-1", "centroid-2"];
const MEAN_PREFIX: &str = "mean_intensity-";

#[derive(Args, Clone)]
pub struct InfectionArgs {
    /// Stats CSV written by `nuctrack stats`
    #[arg(long)]
    pub input: String,
    /// Output CSV with `infected` and `predicted_infected` columns
    #[arg(long)]
    pub output: String,
    /// Channel name of the infection marker, e.g. virus_mCherry
    #[arg(long)]
    pub marker: String,
    /// Channels whose mean intensity feeds the classifier (default: all)
    #[arg(long, value_delimiter = ',')]
    pub features: Vec<String>,
    #[arg(long, default_value_t = 100)]
    pub n_trees: usize,
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfectionParams {
    pub marker: String,
    /// Empty means every `mean_intensity-*` column.
    pub feature_channels: Vec<String>,
    pub forest: ForestParams,
}

impl InfectionParams {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            feature_channels: Vec::new(),
            forest: ForestParams::default(),
        }
    }
}

fn feature_columns(table: &StatsTable, params: &InfectionParams) -> Vec<String> {
    let mut columns: Vec<String> = SHAPE_FEATURES.iter().map(|s| s.to_string()).collect();
    if params.feature_channels.is_empty() {
        columns.extend(
            table
                .columns
                .iter()
                .filter(|c| c.starts_with(MEAN_PREFIX))
                .cloned(),
        );
    } else {
        columns.extend(
            params
                .feature_channels
                .iter()
                .map(|c| format!("{MEAN_PREFIX}{c}")),
        );
    }
    columns
}

/// Copy of `table` with `infected` (Otsu on the marker) and
/// `predicted_infected` (random forest) columns, both 0/1.
pub fn predict_infection(table: &StatsTable, params: &InfectionParams) -> Result<StatsTable> {
    let marker_column = format!("{MEAN_PREFIX}{}", params.marker);
    let marker = table.column(&marker_column)?;
    let cut = threshold::otsu(marker.iter().copied()).map_err(|e| match e {
        Error::DegenerateDistribution(msg) => {
            Error::DegenerateDistribution(format!("{marker_column}: {msg}"))
        }
        other => other,
    })?;
    let infected: Vec<bool> = marker.iter().map(|&v| v > cut).collect();

    let columns = feature_columns(table, params);
    let indices = columns
        .iter()
        .map(|c| table.column_index(c))
        .collect::<Result<Vec<_>>>()?;
    let x: Vec<Vec<f64>> = table
        .rows
        .iter()
        .map(|row| indices.iter().map(|&i| row[i]).collect())
        .collect();

    let forest = RandomForest::fit(&x, &infected, params.forest)?;
    let predicted = x
        .iter()
        .map(|row| forest.predict(row).map(|p| if p { 1.0 } else { 0.0 }))
        .collect::<Result<Vec<f64>>>()?;

    log::warn!(
        "infection calls are heuristic: Otsu cut {cut:.3} on {marker_column}, not validated against ground truth"
    );
    log::debug!("classifier features: {}", columns.join(", "));

    let mut out = table.clone();
    out.add_column(
        "infected",
        infected.iter().map(|&v| if v { 1.0 } else { 0.0 }).collect(),
    )?;
    out.add_column("predicted_infected", predicted)?;
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimepointSummary {
    pub time: i64,
    pub cells: usize,
    pub infected: usize,
    pub predicted_infected: usize,
}

impl TimepointSummary {
    pub fn predicted_rate(&self) -> f64 {
        if self.cells == 0 {
            0.0
        } else {
            self.predicted_infected as f64 / self.cells as f64
        }
    }
}

/// Cell counts and infection calls per timepoint of an annotated table.
pub fn summarize_by_time(table: &StatsTable) -> Result<Vec<TimepointSummary>> {
    let time = table.column_index("time")?;
    let infected = table.column_index("infected")?;
    let predicted = table.column_index("predicted_infected")?;

    let mut by_time: BTreeMap<i64, TimepointSummary> = BTreeMap::new();
    for row in &table.rows {
        let t = row[time] as i64;
        let entry = by_time.entry(t).or_insert(TimepointSummary {
            time: t,
            cells: 0,
            infected: 0,
            predicted_infected: 0,
        });
        entry.cells += 1;
        entry.infected += usize::from(row[infected] > 0.5);
        entry.predicted_infected += usize::from(row[predicted] > 0.5);
    }
    Ok(by_time.into_values().collect())
}

pub fn run(args: InfectionArgs, progress: impl Fn(f64, &str)) -> Result<()> {
    let table = StatsTable::read_csv(Path::new(&args.input))?;
    progress(0.1, &format!("Loaded {} rows from {}", table.len(), args.input));

    let params = InfectionParams {
        marker: args.marker,
        feature_channels: args.features,
        forest: ForestParams {
            n_trees: args.n_trees,
            seed: args.seed,
        },
    };
    let annotated = predict_infection(&table, &params)?;
    annotated.write_csv(Path::new(&args.output))?;

    println!("Heuristic infection calls (Otsu weak labels + random forest, not ground truth)");
    println!("{:>6} {:>8} {:>10} {:>10} {:>8}", "time", "cells", "infected", "predicted", "rate");
    for s in summarize_by_time(&annotated)? {
        println!(
            "{:>6} {:>8} {:>10} {:>10} {:>8.3}",
            s.time,
            s.cells,
            s.infected,
            s.predicted_infected,
            s.predicted_rate()
        );
    }
    progress(1.0, &format!("Wrote {}", args.output));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(marker: impl Fn(usize) -> f64) -> StatsTable {
        let mut t = StatsTable::new(
            [
                "label",
                "area",
                "centroid-0",
                "centroid-1",
                "centroid-2",
                "mean_intensity-DAPI",
                "mean_intensity-virus",
                "time",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        );
        for i in 0..30 {
            t.rows.push(vec![
                (i + 1) as f64,
                20.0 + (i % 5) as f64,
                1.0,
                (i * 3 % 17) as f64,
                (i * 7 % 13) as f64,
                500.0 + (i % 3) as f64,
                marker(i),
                (i / 10) as f64,
            ]);
        }
        t
    }

    #[test]
    fn bright_marker_cells_are_infected() {
        let input = table(|i| if i % 3 == 0 { 900.0 + i as f64 } else { 100.0 + i as f64 });
        let out = predict_infection(&input, &InfectionParams::new("virus")).unwrap();

        let infected = out.column("infected").unwrap();
        let predicted = out.column("predicted_infected").unwrap();
        for i in 0..30 {
            let expected = if i % 3 == 0 { 1.0 } else { 0.0 };
            assert_eq!(infected[i], expected);
            assert_eq!(predicted[i], expected);
        }
        assert_eq!(out.columns.len(), input.columns.len() + 2);
    }

    #[test]
    fn constant_marker_is_an_error() {
        let input = table(|_| 250.0);
        let err = predict_infection(&input, &InfectionParams::new("virus")).unwrap_err();
        assert!(matches!(err, Error::DegenerateDistribution(_)));
    }

    #[test]
    fn unknown_marker_is_a_config_error() {
        let input = table(|i| i as f64);
        let err = predict_infection(&input, &InfectionParams::new("GFP")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn summary_counts_per_timepoint() {
        let input = table(|i| if i < 5 { 1000.0 } else { 10.0 });
        let out = predict_infection(&input, &InfectionParams::new("virus")).unwrap();
        let summary = summarize_by_time(&out).unwrap();
        assert_eq!(summary.len(), 3);
        assert_eq!(summary[0].cells, 10);
        assert_eq!(summary[0].infected, 5);
        assert_eq!(summary[1].infected, 0);
    }

    #[test]
    fn explicit_feature_channels() {
        let mut params = InfectionParams::new("virus");
        params.feature_channels = vec!["DAPI".into()];
        let columns = feature_columns(&table(|i| i as f64), &params);
        assert_eq!(columns.last().map(String::as_str), Some("mean_intensity-DAPI"));
        assert_eq!(columns.len(), 5);
    }
}
