use std::time::Duration;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use tokio::time::sleep;

use crate::{services::autopay_runner::run_autopay, state::AppState};

const TICK: Duration = Duration::from_secs(15);

/// True when the daily autopay run has not happened today and the UTC hour
/// has reached the configured run hour.
fn daily_run_due(last_run: Option<NaiveDate>, now: DateTime<Utc>, run_hour_utc: u32) -> bool {
    last_run != Some(now.date_naive()) && now.hour() >= run_hour_utc
}

/// Background loop that triggers the daily autopay run in-process.
///
/// The run itself is spawned so a panic inside it never stops the loop.
pub async fn run_background_scheduler(state: AppState) {
    let Some(ctx) = state.billing.clone() else {
        tracing::warn!("Scheduler: no database pool configured, exiting");
        return;
    };
    let run_hour = ctx.settings.daily_run_hour_utc;
    let batch_size = state.config.autopay_batch_size(None);
    tracing::info!(run_hour, batch_size, "Background scheduler started");

    let mut last_daily_run: Option<NaiveDate> = None;
    loop {
        sleep(TICK).await;

        let now = Utc::now();
        if !daily_run_due(last_daily_run, now, run_hour) {
            continue;
        }
        last_daily_run = Some(now.date_naive());
        tracing::info!("Scheduler: running daily autopay for {}", now.date_naive());

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let summary = run_autopay(&ctx, Utc::now(), batch_size).await;
            tracing::info!(
                examined = summary.examined,
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                skipped = summary.skipped_total(),
                failed = summary.failed,
                "Scheduler: daily autopay completed"
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn runs_once_per_day_after_the_hour() {
        let early = Utc.with_ymd_and_hms(2026, 3, 2, 4, 59, 0).unwrap();
        let on_time = Utc.with_ymd_and_hms(2026, 3, 2, 5, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 3, 2, 22, 0, 0).unwrap();
        let next_day = Utc.with_ymd_and_hms(2026, 3, 3, 6, 0, 0).unwrap();

        assert!(!daily_run_due(None, early, 5));
        assert!(daily_run_due(None, on_time, 5));
        assert!(!daily_run_due(Some(on_time.date_naive()), later, 5));
        assert!(daily_run_due(Some(on_time.date_naive()), next_day, 5));
    }

    #[test]
    fn same_day_of_year_in_another_year_still_runs() {
        let last = NaiveDate::from_ymd_opt(2025, 3, 2).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        assert!(daily_run_due(Some(last), now, 5));
    }
}
