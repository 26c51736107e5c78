use crate::point::Point;

pub mod influx;

pub use influx::InfluxEncoder;

/// Trait for encoding points into a wire format
pub trait MetricsEncoder: Send + Sync {
    /// Encode a single point as one line, without the trailing newline
    fn encode_point(&self, point: &Point) -> String {
        let mut line = self.encode_batch(std::slice::from_ref(point));
        if line.ends_with('\n') {
            line.pop();
        }
        line
    }

    /// Encode points as newline separated lines, in order
    fn encode_batch(&self, points: &[Point]) -> String;
}
