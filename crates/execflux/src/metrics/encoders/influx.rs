use influxdb_line_protocol::LineProtocolBuilder;

use super::MetricsEncoder;
use crate::point::Point;

/// InfluxDB line protocol encoder
///
/// Measurement, tag and field names are escaped by the builder. Fields are
/// written in name order, floats in their shortest form (`1.5`, `0`).
#[derive(Debug, Default, Clone, Copy)]
pub struct InfluxEncoder;

impl InfluxEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl MetricsEncoder for InfluxEncoder {
    fn encode_batch(&self, points: &[Point]) -> String {
        let mut builder = LineProtocolBuilder::new();

        for point in points {
            let mut after_measurement = builder.measurement(point.measurement());
            for (key, value) in point.tags().iter() {
                after_measurement = after_measurement.tag(key, value);
            }

            let mut fields = point.values().iter();
            let (first_key, first_value) = fields
                .next()
                .expect("Point::new rejects points without values");
            let mut after_field = after_measurement.field(first_key, *first_value);
            for (key, value) in fields {
                after_field = after_field.field(key, *value);
            }

            builder = after_field.timestamp(point.timestamp()).close_line();
        }

        // every input is &str, so the output is valid UTF-8
        String::from_utf8_lossy(&builder.build()).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::collections::HashMap;

    use influxdb_line_protocol::parse_lines;
    use influxdb_line_protocol::FieldValue;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::point::PointFactory;
    use crate::point::TagSet;

    fn point(measurement: &str, tags: &str, values: &[(&str, f64)], ts: i64) -> Point {
        let values = values
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect::<BTreeMap<_, _>>();
        Point::new(measurement, TagSet::parse(tags).unwrap(), values, Some(ts)).unwrap()
    }

    #[test]
    fn encode_summary_point() {
        let mut tags = TagSet::new();
        tags.insert("host", "h").unwrap();
        tags.insert("env", "prod").unwrap();
        let values = BTreeMap::from([
            ("status".to_string(), 0.0),
            ("duration".to_string(), 1.5),
        ]);
        let point = Point::new("events", tags, values, Some(1609459200000000000)).unwrap();

        assert_eq!(
            InfluxEncoder::new().encode_point(&point),
            "events,host=h,env=prod duration=1.5,status=0 1609459200000000000"
        );
    }

    #[test]
    fn encode_without_tags() {
        let point = point("simple_metric", "", &[("value", 42.0)], 1234567890000000000);
        assert_eq!(
            InfluxEncoder::new().encode_point(&point),
            "simple_metric value=42 1234567890000000000"
        );
    }

    #[test]
    fn encode_factory_points() {
        let factory =
            PointFactory::new("events", "node-1", &TagSet::parse("team=ml").unwrap()).unwrap();
        let metric = factory.metric(85.5, 1024, 7).unwrap();

        assert_eq!(
            InfluxEncoder::new().encode_point(&metric),
            "events,host=node-1,team=ml,etype=metric cpu=85.5,mem=1024 7"
        );
    }

    #[test]
    fn encode_escapes_separators() {
        let point = point("my metric", "env=a b", &[("f=1", 1.0)], 1);
        let line = InfluxEncoder::new().encode_point(&point);

        assert!(line.starts_with("my\\ metric,"), "{line}");
        assert!(line.contains("env=a\\ b"), "{line}");
        assert!(line.contains("f\\=1=1"), "{line}");
        assert_eq!(parse_lines(&line).count(), 1);
        assert!(parse_lines(&line).all(|l| l.is_ok()));
    }

    #[test]
    fn encode_batch_keeps_order() {
        let points = vec![
            point("m", "", &[("v", 1.0)], 1),
            point("m", "", &[("v", 2.0)], 2),
            point("m", "", &[("v", 3.0)], 3),
        ];
        let body = InfluxEncoder::new().encode_batch(&points);
        let lines: Vec<&str> = body.lines().collect();

        assert_eq!(lines, vec!["m v=1 1", "m v=2 2", "m v=3 3"]);
    }

    #[test]
    fn encodes_only_point_fields() {
        let factory = PointFactory::new("events", "h", &TagSet::new()).unwrap();
        let points = vec![
            factory.metric(1.0, 2, 3).unwrap(),
            factory.event(0.25, 1).unwrap(),
        ];
        let body = InfluxEncoder::new().encode_batch(&points);

        let names: Vec<Vec<String>> = parse_lines(&body)
            .map(|line| {
                line.unwrap()
                    .field_set
                    .iter()
                    .map(|(k, _)| k.to_string())
                    .collect()
            })
            .collect();
        assert_eq!(
            names,
            vec![
                vec!["cpu".to_string(), "mem".to_string()],
                vec!["duration".to_string(), "status".to_string()],
            ]
        );
    }

    #[test]
    fn encoded_point_parses_back() {
        let original = point(
            "events",
            "env=prod,team=ml,zone=a",
            &[("duration", 12.25), ("status", 3.0), ("cpu", 0.5)],
            1700000000000000000,
        );
        let line = InfluxEncoder::new().encode_point(&original);

        let parsed = parse_lines(&line).next().unwrap().unwrap();
        assert_eq!(parsed.series.measurement.to_string(), "events");
        assert_eq!(parsed.timestamp, Some(1700000000000000000));

        let tags: Vec<(String, String)> = parsed
            .series
            .tag_set
            .unwrap_or_default()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let expected_tags: Vec<(String, String)> = original
            .tags()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(tags, expected_tags);

        let fields: HashMap<String, f64> = parsed
            .field_set
            .iter()
            .map(|(k, v)| match v {
                FieldValue::F64(f) => (k.to_string(), *f),
                other => panic!("unexpected field value {other:?}"),
            })
            .collect();
        let expected_fields: HashMap<String, f64> = original
            .values()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        assert_eq!(fields, expected_fields);
    }
}
