//! Fakes and fixtures for exercising the queue and engine without a server.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageBuffer, ImageFormat, Rgb};

use crate::model::{
    Coordinates, IdempotencyKey, LocalId, NewReport, OfflineReportRecord, UnixTimeMs,
};
use crate::photo::Photo;
use crate::remote::{
    CreateReportRequest, DeliveryError, DeliveryReceipt, ErrorCategory, OfficerProfile, ReportApi,
};
use crate::store::{ReportStore, StoreError};

/// A small valid PNG.
pub fn test_png() -> Vec<u8> {
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(4, 4, Rgb([200, 30, 30]));
    let mut out = Cursor::new(Vec::new());
    // Encoding a 4x4 buffer into memory cannot fail.
    let _ = img.write_to(&mut out, ImageFormat::Png);
    out.into_inner()
}

pub fn test_photo() -> Photo {
    match Photo::from_bytes(test_png(), 1 << 20) {
        Ok(photo) => photo,
        Err(e) => panic!("fixture photo rejected: {e}"),
    }
}

pub fn test_coordinates() -> Coordinates {
    match Coordinates::new(-6.2088, 106.8456) {
        Ok(c) => c,
        Err(e) => panic!("fixture coordinates rejected: {e}"),
    }
}

/// A report captured at `captured_at_ms`.
pub fn new_report(captured_at_ms: u64) -> NewReport {
    NewReport::new(test_photo(), test_coordinates(), UnixTimeMs(captured_at_ms))
}

pub fn sample_record(captured_at_ms: u64) -> OfflineReportRecord {
    OfflineReportRecord::from_capture(new_report(captured_at_ms), UnixTimeMs(captured_at_ms))
}

// ============================================================================
// Remote API fake
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FakeResponse {
    Ok,
    Fail(ErrorCategory),
    /// The server stores the report but the response is lost.
    CommitThenTimeout,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordedCall {
    pub key: String,
    pub captured_at: String,
    pub notes: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Default)]
struct FakeState {
    script: VecDeque<FakeResponse>,
    created: HashMap<String, String>,
    calls: Vec<RecordedCall>,
    profile: Option<OfficerProfile>,
    profile_script: VecDeque<Result<Option<OfficerProfile>, ErrorCategory>>,
    profile_calls: usize,
}

/// In-memory report endpoint that honours idempotency keys: a key it has
/// already stored is acknowledged as a duplicate, never created twice.
///
/// Responses are scripted in order; once the script runs out every call
/// succeeds.
#[derive(Default)]
pub struct FakeReportApi {
    state: Mutex<FakeState>,
    delay: Mutex<Option<Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_id: AtomicU64,
}

impl FakeReportApi {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push_response(&self, response: FakeResponse) {
        self.state().script.push_back(response);
    }

    pub fn set_delay(&self, delay: Duration) {
        if let Ok(mut d) = self.delay.lock() {
            *d = Some(delay);
        }
    }

    pub fn set_profile(&self, profile: Option<OfficerProfile>) {
        self.state().profile = profile;
    }

    pub fn push_profile_response(&self, response: Result<Option<OfficerProfile>, ErrorCategory>) {
        self.state().profile_script.push_back(response);
    }

    pub fn profile_calls(&self) -> usize {
        self.state().profile_calls
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    /// Distinct reports the server holds.
    pub fn created_count(&self) -> usize {
        self.state().created.len()
    }

    pub fn was_created(&self, key: &IdempotencyKey) -> bool {
        self.state().created.contains_key(key.as_str())
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReportApi for FakeReportApi {
    async fn submit(
        &self,
        key: &IdempotencyKey,
        request: &CreateReportRequest,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = {
            let mut state = self.state();
            state.calls.push(RecordedCall {
                key: key.as_str().to_string(),
                captured_at: request.captured_at.clone(),
                notes: request.notes.clone(),
                latitude: request.latitude,
                longitude: request.longitude,
            });

            let response = state.script.pop_front().unwrap_or(FakeResponse::Ok);
            match response {
                FakeResponse::Ok => {
                    if let Some(id) = state.created.get(key.as_str()) {
                        Ok(DeliveryReceipt {
                            report_id: Some(id.clone()),
                            duplicate: true,
                        })
                    } else {
                        let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                        state.created.insert(key.as_str().to_string(), id.clone());
                        Ok(DeliveryReceipt {
                            report_id: Some(id),
                            duplicate: false,
                        })
                    }
                }
                FakeResponse::Fail(category) => Err(DeliveryError::new(
                    category,
                    format!("fake_{category}"),
                    "scripted failure",
                    UnixTimeMs::now(),
                )),
                FakeResponse::CommitThenTimeout => {
                    let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
                    state
                        .created
                        .entry(key.as_str().to_string())
                        .or_insert(id);
                    Err(DeliveryError::new(
                        ErrorCategory::Timeout,
                        "timeout",
                        "response lost after commit",
                        UnixTimeMs::now(),
                    ))
                }
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn current_officer(&self) -> Result<Option<OfficerProfile>, DeliveryError> {
        let mut state = self.state();
        state.profile_calls += 1;
        match state.profile_script.pop_front() {
            Some(Ok(profile)) => Ok(profile),
            Some(Err(category)) => Err(DeliveryError::new(
                category,
                format!("fake_{category}"),
                "scripted profile failure",
                UnixTimeMs::now(),
            )),
            None => Ok(state.profile.clone()),
        }
    }
}

pub fn security_officer(unit: Option<&str>) -> OfficerProfile {
    OfficerProfile {
        id: "officer-1".into(),
        full_name: Some("Budi Santoso".into()),
        role: OfficerProfile::SECURITY_ROLE.into(),
        assigned_unit_id: unit.map(str::to_string),
    }
}

// ============================================================================
// Failure-injectable storage wrapper
// ============================================================================

pub struct FailableStore<S: ReportStore> {
    inner: S,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl<S: ReportStore> FailableStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_puts: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: ReportStore> ReportStore for FailableStore<S> {
    async fn load_all(
        &self,
    ) -> Result<Vec<Result<OfflineReportRecord, StoreError>>, StoreError> {
        self.inner.load_all().await
    }

    async fn put(&self, record: &OfflineReportRecord) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        self.inner.put(record).await
    }

    async fn get(&self, local_id: &LocalId) -> Result<Option<OfflineReportRecord>, StoreError> {
        self.inner.get(local_id).await
    }

    async fn delete(&self, local_id: &LocalId) -> Result<bool, StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected delete failure".into()));
        }
        self.inner.delete(local_id).await
    }

    async fn list_ids(&self) -> Result<Vec<LocalId>, StoreError> {
        self.inner.list_ids().await
    }
}
