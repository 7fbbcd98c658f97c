//! Upload scheduler: fixed daily fire hours, single-flight cycle.
//!
//! A cycle is assemble, authenticate, upload, then the optional sheet
//! append, run strictly in that order. At most one cycle is ever in
//! flight; a firing that lands while one is running is dropped, not
//! queued. Stopping the scheduler only cancels future firings.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Days, Local, NaiveTime, TimeZone};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::assembly::{self, AssemblyError};
use crate::events::{EventScope, EventSink};
use crate::frames::FrameName;
use crate::google::auth::{self, AuthError};
use crate::google::sheets::{self, SheetError};
use crate::google::youtube::{self, UploadError};

/// Header row written on a sheet's first append.
pub const SHEET_HEADER: [&str; 2] = ["Uploaded Date", "Link"];

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("upload frequency must be between 1 and 6, got {0}")]
    InvalidFrequency(u8),
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("video assembly failed: {0}")]
    Assembly(#[from] AssemblyError),
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("video upload failed: {0}")]
    Upload(#[from] UploadError),
}

/// Hours of day at which a given frequency selector fires.
pub fn fire_hours(frequency: u8) -> Result<&'static [u32], ScheduleError> {
    match frequency {
        1 => Ok(&[0]),
        2 => Ok(&[0, 12]),
        3 => Ok(&[0, 8, 16]),
        4 => Ok(&[0, 6, 12, 18]),
        5 => Ok(&[0, 5, 10, 15, 20]),
        6 => Ok(&[0, 4, 8, 12, 16, 20]),
        other => Err(ScheduleError::InvalidFrequency(other)),
    }
}

/// Earliest top-of-hour in `hours` strictly after `after`.
///
/// Rolls to the first slot of the next day when every slot today has
/// passed. A slot erased by a DST gap is skipped.
pub fn next_fire(after: DateTime<Local>, hours: &[u32]) -> DateTime<Local> {
    let mut date = after.date_naive();
    loop {
        for &hour in hours {
            if let Some(time) = NaiveTime::from_hms_opt(hour, 0, 0) {
                if let Some(candidate) = Local
                    .from_local_datetime(&date.and_time(time))
                    .earliest()
                {
                    if candidate > after {
                        return candidate;
                    }
                }
            }
        }
        date = date
            .checked_add_days(Days::new(1))
            .unwrap_or(date);
    }
}

/// Mutual exclusion for upload cycles.
///
/// `try_begin` yields a guard while no cycle holds one; the guard releases
/// on drop, so every exit path of a cycle, including errors, re-arms the
/// scheduler.
#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    lock: Arc<Mutex<()>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self) -> Option<OwnedMutexGuard<()>> {
        self.lock.clone().try_lock_owned().ok()
    }
}

/// Everything one upload cycle needs, fixed at scheduler start.
#[derive(Debug, Clone)]
pub struct CycleParams {
    pub ffmpeg_path: PathBuf,
    pub input_dir: PathBuf,
    pub fps: u32,
    pub manifest_file: PathBuf,
    pub secret_file: PathBuf,
    pub token_file: PathBuf,
    pub sheet: Option<SheetTarget>,
}

#[derive(Debug, Clone)]
pub struct SheetTarget {
    pub sheet_id: String,
    pub sheet_title: String,
}

/// Handle to a running upload scheduler.
pub struct UploadHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl UploadHandle {
    /// Cancel future firings and wait for the scheduler task.
    ///
    /// A cycle already in flight runs to completion first; cancellation is
    /// only observed while waiting for the next fire time.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Start the upload scheduler for the given frequency selector.
pub fn start(
    frequency: u8,
    params: CycleParams,
    sink: EventSink,
) -> Result<UploadHandle, ScheduleError> {
    let hours = fire_hours(frequency)?;
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let in_flight = SingleFlight::new();

    let task = tokio::spawn(async move {
        info!(frequency, ?hours, "upload scheduler started");

        loop {
            let now = Local::now();
            let fire_at = next_fire(now, hours);
            let wait = (fire_at - now)
                .to_std()
                .unwrap_or_else(|_| std::time::Duration::from_secs(0));
            debug!(%fire_at, "next upload cycle scheduled");

            tokio::select! {
                _ = loop_cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            match in_flight.try_begin() {
                Some(_guard) => {
                    if let Err(e) = run_cycle(&params, &sink).await {
                        error!("upload cycle failed: {e}");
                        sink.message(EventScope::Upload, format!("Upload cycle failed: {e}"));
                    }
                }
                // A cycle is still running from a previous firing; this
                // firing is dropped, not queued.
                None => {}
            }
        }

        info!("upload scheduler stopped");
    });

    Ok(UploadHandle { cancel, task })
}

/// One complete cycle: assemble, authenticate, upload, optional append.
pub async fn run_cycle(params: &CycleParams, sink: &EventSink) -> Result<(), CycleError> {
    let stamp = FrameName::now();

    let video_file = assembly::assemble(
        &params.ffmpeg_path,
        &params.input_dir,
        params.fps,
        &params.manifest_file,
        sink,
    )
    .await?;

    sink.message(EventScope::Upload, "Uploading video...");

    let client = auth::load_client(&params.secret_file, &params.token_file).await?;
    let video_url = youtube::upload_video(&client, &stamp.second, &video_file, sink).await?;

    sink.message(EventScope::Upload, format!("Uploaded: {video_url}"));

    if let Some(sheet) = &params.sheet {
        let row = vec![Local::now().to_rfc2822(), video_url];
        if let Err(e) = append_result_row(&client, sheet, &row).await {
            // The video is already live; the missing sheet row is reported
            // without failing the cycle.
            error!("sheet append failed: {e}");
            sink.message(EventScope::Upload, format!("Sheet append failed: {e}"));
        }
    }

    Ok(())
}

async fn append_result_row(
    client: &auth::AuthClient,
    sheet: &SheetTarget,
    row: &[String],
) -> Result<(), SheetError> {
    sheets::append_row(client, &sheet.sheet_id, &sheet.sheet_title, &SHEET_HEADER, row).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn frequency_table_matches_documented_hours() {
        assert_eq!(fire_hours(1).unwrap(), &[0]);
        assert_eq!(fire_hours(2).unwrap(), &[0, 12]);
        assert_eq!(fire_hours(3).unwrap(), &[0, 8, 16]);
        assert_eq!(fire_hours(4).unwrap(), &[0, 6, 12, 18]);
        assert_eq!(fire_hours(5).unwrap(), &[0, 5, 10, 15, 20]);
        assert_eq!(fire_hours(6).unwrap(), &[0, 4, 8, 12, 16, 20]);
    }

    #[test]
    fn frequency_outside_range_is_rejected() {
        assert!(matches!(
            fire_hours(0),
            Err(ScheduleError::InvalidFrequency(0))
        ));
        assert!(matches!(
            fire_hours(7),
            Err(ScheduleError::InvalidFrequency(7))
        ));
    }

    #[test]
    fn next_fire_picks_next_slot_today() {
        let after = Local.with_ymd_and_hms(2024, 3, 7, 5, 30, 0).unwrap();
        let fire = next_fire(after, &[0, 6, 12, 18]);
        assert_eq!(fire, Local.with_ymd_and_hms(2024, 3, 7, 6, 0, 0).unwrap());
    }

    #[test]
    fn next_fire_is_strictly_after() {
        // Exactly on a slot: that slot has fired, the next one is due.
        let after = Local.with_ymd_and_hms(2024, 3, 7, 6, 0, 0).unwrap();
        let fire = next_fire(after, &[0, 6, 12, 18]);
        assert_eq!(fire.hour(), 12);
    }

    #[test]
    fn next_fire_rolls_to_tomorrow() {
        let after = Local.with_ymd_and_hms(2024, 3, 7, 19, 0, 0).unwrap();
        let fire = next_fire(after, &[0, 6, 12, 18]);
        assert_eq!(fire, Local.with_ymd_and_hms(2024, 3, 8, 0, 0, 0).unwrap());
    }

    #[test]
    fn next_fire_midnight_only() {
        let after = Local.with_ymd_and_hms(2024, 12, 31, 0, 0, 1).unwrap();
        let fire = next_fire(after, &[0]);
        assert_eq!(fire, Local.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn single_flight_blocks_second_entry() {
        let flight = SingleFlight::new();
        let guard = flight.try_begin().expect("first entry");
        assert!(flight.try_begin().is_none());
        drop(guard);
        assert!(flight.try_begin().is_some());
    }

    #[test]
    fn busy_flight_skips_cycle_without_queuing() {
        let flight = SingleFlight::new();
        let _held = flight.try_begin().unwrap();

        let mut runs = 0;
        for _ in 0..3 {
            if flight.try_begin().is_some() {
                runs += 1;
            }
        }
        assert_eq!(runs, 0);
    }

    #[tokio::test]
    async fn guard_releases_on_error_paths() {
        let flight = SingleFlight::new();

        let result: Result<(), &str> = async {
            let _guard = flight.try_begin().unwrap();
            Err("cycle blew up")
        }
        .await;
        assert!(result.is_err());

        // The failed cycle must not wedge the scheduler.
        assert!(flight.try_begin().is_some());
    }
}
