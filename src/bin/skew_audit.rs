use std::path::PathBuf;

use chrono::NaiveDateTime;
use fraud_features::{
    batch_window_counts, init_logging, load_ip_ranges_csv, log_app_start, log_fit_state_ready,
    log_replay_finish, logging_config_from_env, parse_records, parse_timestamp,
    read_raw_transactions, velocity_config_from_env, DataQualityReport, FeatureEngineer,
    FeatureStore, FitState, RangeLookup, ReplaySummary, VelocityConfig,
};

const APP: &str = "skew_audit";

const MAX_REPORTED_MISMATCHES: usize = 10;

#[derive(Debug)]
struct Mismatch {
    row: usize,
    user_id: i64,
    purchase_time: NaiveDateTime,
    training_count: usize,
    serving_count: usize,
    max_abs_diff: f64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    let velocity_cfg = velocity_config_from_env();
    log_app_start(APP, &logging_cfg, &velocity_cfg);

    let transactions_path = std::env::var("FRAUD_FEATURES_TRANSACTIONS_CSV")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/Fraud_Data.csv"));
    let ranges = match std::env::var("FRAUD_FEATURES_IP_RANGES_CSV") {
        Ok(path) => load_ip_ranges_csv(&PathBuf::from(path))?,
        Err(_) => RangeLookup::empty(),
    };
    let replay_from = match std::env::var("FRAUD_FEATURES_REPLAY_FROM") {
        Ok(raw) => Some(parse_timestamp("FRAUD_FEATURES_REPLAY_FROM", &raw)?),
        Err(_) => None,
    };

    println!(
        "Auditing train/serve skew for {} (ranges={} window={}s lateness={}s)",
        transactions_path.display(),
        ranges.len(),
        velocity_cfg.window_seconds,
        velocity_cfg.allowed_lateness_seconds
    );

    let raw = read_raw_transactions(std::fs::File::open(&transactions_path)?)?;
    let quality = DataQualityReport::from_raw(&raw);
    println!("\nData quality: rows={}", quality.rows);
    for (column, missing) in quality.missing.iter().filter(|(_, n)| *n > 0) {
        println!("  {column}: missing={missing}");
    }
    if quality.is_clean() {
        println!("  no missing required values");
    }

    let table = parse_records(raw)?;
    let mut trainer = FeatureEngineer::new(velocity_cfg, ranges.clone())?;
    let fitted = trainer.fit_transform(&table)?;
    let blob = trainer.fit_state()?.to_json()?;
    let restored = FitState::from_json(&blob)?;
    log_fit_state_ready(APP, &restored, ranges.len());
    println!(
        "\nFitted: rows={} width={} fingerprint={}",
        fitted.matrix.len(),
        fitted.matrix.width(),
        restored.fingerprint
    );

    let store_cfg = VelocityConfig {
        window_seconds: restored.window_seconds,
        ..velocity_cfg
    };
    let server = FeatureEngineer::from_fit_state(restored, ranges)?;
    let store = FeatureStore::<i64>::new(store_cfg)?;

    let keys: Vec<i64> = table.iter().map(|tx| tx.user_id).collect();
    let times: Vec<NaiveDateTime> = table.iter().map(|tx| tx.purchase_time).collect();
    let training_counts = batch_window_counts(&keys, &times, store_cfg.window());

    let mut order: Vec<usize> = (0..table.len()).collect();
    order.sort_by_key(|idx| (table[*idx].purchase_time, *idx));

    let mut replayed = 0usize;
    let mut mismatches = Vec::new();
    for idx in order {
        let tx = &table[idx];
        if replay_from.is_some_and(|from| tx.purchase_time < from) {
            continue;
        }

        let serving_count = store.record_and_count(&tx.user_id, tx.purchase_time);
        let serving = server.apply_one(tx, Some(serving_count))?;
        replayed += 1;

        let training = fitted.matrix.row(idx).unwrap_or_default();
        if serving.as_slice() != training {
            let max_abs_diff = serving
                .iter()
                .zip(training)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0_f64, f64::max);
            mismatches.push(Mismatch {
                row: idx,
                user_id: tx.user_id,
                purchase_time: tx.purchase_time,
                training_count: training_counts[idx],
                serving_count,
                max_abs_diff,
            });
        }
    }

    let summary = ReplaySummary {
        replayed,
        skipped: table.len() - replayed,
        mismatched: mismatches.len(),
    };
    log_replay_finish(APP, &summary);
    println!(
        "\nReplay: replayed={} skipped={} mismatched={}",
        summary.replayed, summary.skipped, summary.mismatched
    );
    for m in mismatches.iter().take(MAX_REPORTED_MISMATCHES) {
        println!(
            "  row={} user_id={} purchase_time={} training_count={} serving_count={} max_abs_diff={:.6}",
            m.row, m.user_id, m.purchase_time, m.training_count, m.serving_count, m.max_abs_diff
        );
    }
    if mismatches.len() > MAX_REPORTED_MISMATCHES {
        println!("  ... {} more", mismatches.len() - MAX_REPORTED_MISMATCHES);
    }

    Ok(())
}
