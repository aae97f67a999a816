//! Read-only view of studios and rooms.
//!
//! Catalog management lives outside this service. The core only needs a room's
//! owning studio, hourly rate and working hours, and a studio's staff list.

use std::path::Path;

use async_trait::async_trait;
use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc, Weekday,
};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;
use crate::model::{Ms, RoomId, Span, StudioId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningHours {
    #[serde(with = "hhmm")]
    pub open: NaiveTime,
    #[serde(with = "hhmm")]
    pub close: NaiveTime,
}

/// Weekly opening hours. A missing day means the room is closed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHoursSchedule {
    #[serde(default)]
    pub monday: Option<OpeningHours>,
    #[serde(default)]
    pub tuesday: Option<OpeningHours>,
    #[serde(default)]
    pub wednesday: Option<OpeningHours>,
    #[serde(default)]
    pub thursday: Option<OpeningHours>,
    #[serde(default)]
    pub friday: Option<OpeningHours>,
    #[serde(default)]
    pub saturday: Option<OpeningHours>,
    #[serde(default)]
    pub sunday: Option<OpeningHours>,
    /// Studio wall-clock offset from UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl WorkingHoursSchedule {
    pub fn hours_on(&self, day: Weekday) -> Option<OpeningHours> {
        match day {
            Weekday::Mon => self.monday,
            Weekday::Tue => self.tuesday,
            Weekday::Wed => self.wednesday,
            Weekday::Thu => self.thursday,
            Weekday::Fri => self.friday,
            Weekday::Sat => self.saturday,
            Weekday::Sun => self.sunday,
        }
    }

    /// Out-of-range offsets fall back to UTC.
    pub fn offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60)).unwrap_or(Utc.fix())
    }

    /// The studio-local working window for `date` as UTC milliseconds.
    /// `None` when the room is closed that day. The span is empty when
    /// `close <= open`.
    pub fn window_on(&self, date: NaiveDate) -> Option<(OpeningHours, Span)> {
        let hours = self.hours_on(date.weekday())?;
        let offset = self.offset();
        let open = offset
            .from_local_datetime(&date.and_time(hours.open))
            .single()?;
        let close = offset
            .from_local_datetime(&date.and_time(hours.close))
            .single()?;
        Some((hours, Span::new(open.timestamp_millis(), close.timestamp_millis())))
    }

    /// Render an instant as studio-local `HH:MM`.
    pub fn local_hhmm(&self, at: Ms) -> String {
        DateTime::<Utc>::from_timestamp_millis(at)
            .map(|t| t.with_timezone(&self.offset()).format("%H:%M").to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub studio_id: StudioId,
    #[serde(with = "rust_decimal::serde::str")]
    pub hourly_rate: Decimal,
    #[serde(default)]
    pub schedule: WorkingHoursSchedule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Studio {
    pub id: StudioId,
    pub owner_id: UserId,
    #[serde(default)]
    pub manager_ids: Vec<UserId>,
}

impl Studio {
    pub fn is_staff(&self, user: UserId) -> bool {
        self.owner_id == user || self.manager_ids.contains(&user)
    }
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn room(&self, id: RoomId) -> Result<Option<Room>>;
    async fn studio(&self, id: StudioId) -> Result<Option<Studio>>;
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("room {room} references unknown studio {studio}")]
    UnknownStudio { room: RoomId, studio: StudioId },
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    studios: Vec<Studio>,
    #[serde(default)]
    rooms: Vec<Room>,
}

/// In-memory catalog, optionally seeded from a JSON file of the form
/// `{"studios": [...], "rooms": [...]}`.
#[derive(Default)]
pub struct StaticCatalog {
    rooms: DashMap<RoomId, Room>,
    studios: DashMap<StudioId, Studio>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(text)?;
        let catalog = Self::new();
        for studio in file.studios {
            catalog.insert_studio(studio);
        }
        for room in file.rooms {
            if !catalog.studios.contains_key(&room.studio_id) {
                return Err(CatalogError::UnknownStudio {
                    room: room.id,
                    studio: room.studio_id,
                });
            }
            catalog.insert_room(room);
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn insert_studio(&self, studio: Studio) {
        self.studios.insert(studio.id, studio);
    }

    pub fn insert_room(&self, room: Room) {
        self.rooms.insert(room.id, room);
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn room(&self, id: RoomId) -> Result<Option<Room>> {
        Ok(self.rooms.get(&id).map(|r| r.value().clone()))
    }

    async fn studio(&self, id: StudioId) -> Result<Option<Studio>> {
        Ok(self.studios.get(&id).map(|s| s.value().clone()))
    }
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let text = String::deserialize(d)?;
        NaiveTime::parse_from_str(&text, FORMAT).map_err(serde::de::Error::custom)
    }
}
