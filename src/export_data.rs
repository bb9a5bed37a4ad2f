use std::io::Write;

use anyhow::Result;
use geo_types::Point;
use gpx::{Gpx, GpxVersion, Track, TrackSegment, Waypoint};

use crate::route_tracker::TrackingResult;

pub fn route_to_gpx(result: &TrackingResult) -> Gpx {
    let mut segment = TrackSegment::new();
    for point in &result.coordinates {
        // `geo_types::Point` is (x, y), so longitude goes first
        segment
            .points
            .push(Waypoint::new(Point::new(point.longitude, point.latitude)));
    }
    let mut track = Track::new();
    track.name = Some("Route".to_string());
    track.segments.push(segment);

    let mut gpx = Gpx::default();
    gpx.version = GpxVersion::Gpx11;
    gpx.creator = Some("ecotrack".to_string());
    gpx.tracks.push(track);
    gpx
}

pub fn export_route_gpx<W: Write>(result: &TrackingResult, writer: &mut W) -> Result<()> {
    let gpx = route_to_gpx(result);
    gpx::write(&gpx, writer)?;
    Ok(())
}
