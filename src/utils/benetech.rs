//! Benetech chart scoring.
//!
//! Charts are exchanged as DePlot linearized tables: rows are separated by
//! `<0x0A>` (or a newline), the first row names the chart type and every
//! other row is an `x | y` pair.

const ROW_SEPARATOR: &str = "<0x0A>";
const CELL_SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChartTable {
    pub chart_type: String,
    pub xs: Vec<String>,
    pub ys: Vec<String>,
}

impl ChartTable {
    pub fn parse(text: &str) -> Self {
        let mut rows = text
            .split(ROW_SEPARATOR)
            .flat_map(|chunk| chunk.split('\n'))
            .map(str::trim)
            .filter(|row| !row.is_empty());

        let chart_type = rows.next().unwrap_or_default().to_string();
        let (xs, ys) = rows
            .map(|row| {
                let mut cells = row.splitn(2, CELL_SEPARATOR).map(str::trim);
                let x = cells.next().unwrap_or_default().to_string();
                let y = cells.next().unwrap_or_default().to_string();
                (x, y)
            })
            .unzip();

        Self { chart_type, xs, ys }
    }
}

/// Maps a non-negative error onto `(0, 1]`, `0` error giving `1`.
fn sigmoid(x: f64) -> f64 {
    2.0 - 2.0 / (1.0 + (-x).exp())
}

fn rmse(truth: &[f64], pred: &[f64]) -> f64 {
    let sum = truth
        .iter()
        .zip(pred)
        .map(|(t, p)| (t - p).powi(2))
        .sum::<f64>();

    (sum / truth.len() as f64).sqrt()
}

fn normalized_rmse(truth: &[f64], pred: &[f64]) -> f64 {
    let mean = truth.iter().sum::<f64>() / truth.len() as f64;
    let baseline = rmse(truth, &vec![mean; truth.len()]);
    let error = rmse(truth, pred);

    match (error == 0.0, baseline == 0.0) {
        (true, _) => 1.0,
        (false, true) => 0.0,
        (false, false) => sigmoid(error / baseline),
    }
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != *cb);
            cur[j + 1] = substitution.min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }

    prev[b.len()]
}

fn normalized_levenshtein(truth: &[String], pred: &[String]) -> f64 {
    let distance = truth
        .iter()
        .zip(pred)
        .map(|(t, p)| levenshtein(t, p))
        .sum::<usize>();
    let length = truth.iter().map(|t| t.chars().count()).sum::<usize>();

    match (distance, length) {
        (0, _) => 1.0,
        (_, 0) => 0.0,
        _ => sigmoid(distance as f64 / length as f64),
    }
}

fn parse_numbers(values: &[String]) -> Option<Vec<f64>> {
    values
        .iter()
        .map(|v| v.replace(',', "").parse::<f64>().ok())
        .collect()
}

/// Scores one data series. Numeric ground truth is compared with RMSE,
/// anything else with Levenshtein distance.
pub fn score_series(truth: &[String], pred: &[String]) -> f64 {
    if truth.len() != pred.len() {
        return 0.0;
    }
    if truth.is_empty() {
        return 1.0;
    }

    match parse_numbers(truth) {
        Some(truth) => match parse_numbers(pred) {
            Some(pred) => normalized_rmse(&truth, &pred),
            None => 0.0,
        },
        None => normalized_levenshtein(truth, pred),
    }
}

/// Score in `[0, 1]` of one predicted chart table against its ground truth.
pub fn benetech_score(ground_truth: &str, prediction: &str) -> f64 {
    let truth = ChartTable::parse(ground_truth);
    let pred = ChartTable::parse(prediction);

    if truth.chart_type != pred.chart_type {
        return 0.0;
    }

    (score_series(&truth.xs, &pred.xs) + score_series(&truth.ys, &pred.ys)) / 2.0
}
