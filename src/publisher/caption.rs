use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::camera::Camera;
use crate::publisher::LinkFacet;

#[derive(Debug, Clone, PartialEq)]
pub struct Caption {
    pub text: String,
    pub link: Option<LinkFacet>,
}

pub struct CaptionStyle<'a> {
    pub timezone: Tz,
    pub tz_abbrev: &'a str,
    pub timelapse_24h: bool,
}

/// `<name>\n🕒 <start> - <end> <TZ>`, plus a maps-linked coordinate line when
/// the camera position is known.
pub fn compose(camera: &Camera, start: DateTime<Utc>, end: DateTime<Utc>, style: &CaptionStyle<'_>) -> Caption {
    let time_range = format!(
        "{} - {} {}",
        format_time(start, style.timezone),
        format_time(end, style.timezone),
        style.tz_abbrev
    );
    let time_label = if style.timelapse_24h {
        format!("24-Hour Timelapse: {}", time_range)
    } else {
        time_range
    };

    let heading = format!("{}\n🕒 {}", camera.name, time_label);
    if !camera.has_coordinates() {
        return Caption { text: heading, link: None };
    }

    let coordinates = format!("{},{}", camera.latitude, camera.longitude);
    let prefix = format!("{}\n\n📍: ", heading);
    let byte_start = prefix.len();
    let link = LinkFacet {
        byte_start,
        byte_end: byte_start + coordinates.len(),
        uri: format!("https://www.google.com/maps?q={}", coordinates),
    };

    Caption { text: format!("{}{}", prefix, coordinates), link: Some(link) }
}

fn format_time(time: DateTime<Utc>, timezone: Tz) -> String {
    time.with_timezone(&timezone).format("%-I:%M %p").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn camera(latitude: f64, longitude: f64) -> Camera {
        Camera {
            id: "42".into(),
            name: "I-71 at I-75".into(),
            url: "http://cam/42.jpg".into(),
            latitude,
            longitude,
            has_video: false,
            headers: Default::default(),
            resolve_redirect: false,
        }
    }

    fn style(timelapse_24h: bool) -> CaptionStyle<'static> {
        CaptionStyle { timezone: chrono_tz::America::New_York, tz_abbrev: "ET", timelapse_24h }
    }

    #[test]
    fn test_caption_without_coordinates() {
        let start = Utc.with_ymd_and_hms(2026, 7, 4, 18, 5, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 7, 4, 19, 30, 0).unwrap();

        let caption = compose(&camera(0.0, 0.0), start, end, &style(false));
        assert_eq!(caption.text, "I-71 at I-75\n🕒 2:05 PM - 3:30 PM ET");
        assert!(caption.link.is_none());
    }

    #[test]
    fn test_caption_with_coordinates_links_exact_bytes() {
        let start = Utc.with_ymd_and_hms(2026, 1, 10, 4, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 1, 10, 5, 15, 0).unwrap();

        let caption = compose(&camera(39.1031, -84.512), start, end, &style(true));
        assert_eq!(
            caption.text,
            "I-71 at I-75\n🕒 24-Hour Timelapse: 11:00 PM - 12:15 AM ET\n\n📍: 39.1031,-84.512"
        );

        let link = caption.link.unwrap();
        assert_eq!(&caption.text.as_bytes()[link.byte_start..link.byte_end], b"39.1031,-84.512");
        assert_eq!(link.uri, "https://www.google.com/maps?q=39.1031,-84.512");
    }
}
