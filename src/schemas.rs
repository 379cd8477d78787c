// Maintain file schemas that are used both by the per-image and the global outputs.

use serde::Serialize;

use crate::join::JoinedDot;
use crate::nuclei::NucleusId;

pub const IMAGE_JOIN_HEADERS: [&str; 7] = ["x", "y", "t", "c", "intensity", "nucleus_id", "channel"];

pub const GLOBAL_JOIN_HEADERS: [&str; 8] = [
    "x",
    "y",
    "t",
    "c",
    "intensity",
    "nucleus_id",
    "channel",
    "filename",
];

// Field order must match IMAGE_JOIN_HEADERS.
#[derive(Serialize)]
pub struct ImageJoinRow {
    pub x: f64,
    pub y: f64,
    pub t: u32,
    pub c: u32,
    pub intensity: f64,
    pub nucleus_id: Option<NucleusId>,
    pub channel: u32,
}

impl From<&JoinedDot> for ImageJoinRow {
    fn from(joined: &JoinedDot) -> Self {
        ImageJoinRow {
            x: joined.dot.x,
            y: joined.dot.y,
            t: joined.dot.t,
            c: joined.dot.c,
            intensity: joined.dot.intensity,
            nucleus_id: joined.nucleus_id,
            channel: joined.channel,
        }
    }
}

// Field order must match GLOBAL_JOIN_HEADERS.
#[derive(Serialize)]
pub struct GlobalJoinRow<'a> {
    pub x: f64,
    pub y: f64,
    pub t: u32,
    pub c: u32,
    pub intensity: f64,
    pub nucleus_id: Option<NucleusId>,
    pub channel: u32,
    pub filename: &'a str,
}

impl<'a> GlobalJoinRow<'a> {
    pub fn new(joined: &JoinedDot, filename: &'a str) -> Self {
        GlobalJoinRow {
            x: joined.dot.x,
            y: joined.dot.y,
            t: joined.dot.t,
            c: joined.dot.c,
            intensity: joined.dot.intensity,
            nucleus_id: joined.nucleus_id,
            channel: joined.channel,
            filename,
        }
    }
}
