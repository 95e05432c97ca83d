use gridclaim_shared::GridGeometry;
use gridclaim_shared::geometry::{DEFAULT_CHUNK_SIZE, DEFAULT_GRID_STEP, DEFAULT_WORLD_SIZE};

pub const SSE_KEEPALIVE_SECS: u64 = 15;
pub const DEFAULT_BROADCAST_BUFFER: usize = 256;
pub const DEFAULT_MAX_BATCH_CLAIM: usize = 100_000;
pub const DEFAULT_SERVER_PORT: u16 = 3000;
/// Widest range query accepted on either axis, in chunks.
pub const MAX_RANGE_CHUNKS: i64 = 16;
/// Request body cap, sized for a full batch claim.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

pub fn server_port() -> u16 {
    std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_SERVER_PORT)
}

pub fn sse_broadcast_buffer() -> usize {
    std::env::var("SSE_BROADCAST_BUFFER")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_BROADCAST_BUFFER)
}

pub fn max_batch_claim() -> usize {
    std::env::var("MAX_BATCH_CLAIM")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_BATCH_CLAIM)
}

/// Grid geometry from `WORLD_SIZE` / `GRID_STEP` / `CHUNK_SIZE`. An
/// inconsistent combination falls back to the defaults as a whole.
pub fn grid_geometry() -> GridGeometry {
    let read = |name: &str, default: i64| {
        std::env::var(name)
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(default)
    };
    let world = read("WORLD_SIZE", DEFAULT_WORLD_SIZE);
    let step = read("GRID_STEP", DEFAULT_GRID_STEP);
    let chunk = read("CHUNK_SIZE", DEFAULT_CHUNK_SIZE);
    GridGeometry::new(world, step, chunk).unwrap_or_else(|| {
        tracing::warn!(world, step, chunk, "invalid grid geometry, using defaults");
        GridGeometry::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_falls_back_on_garbage() {
        temp_env::with_var("PORT", Some("not-a-port"), || {
            assert_eq!(server_port(), DEFAULT_SERVER_PORT);
        });
        temp_env::with_var("PORT", Some("8080"), || {
            assert_eq!(server_port(), 8080);
        });
    }

    #[test]
    fn zero_buffer_and_batch_limits_are_rejected() {
        temp_env::with_vars(
            [
                ("SSE_BROADCAST_BUFFER", Some("0")),
                ("MAX_BATCH_CLAIM", Some("0")),
            ],
            || {
                assert_eq!(sse_broadcast_buffer(), DEFAULT_BROADCAST_BUFFER);
                assert_eq!(max_batch_claim(), DEFAULT_MAX_BATCH_CLAIM);
            },
        );
        temp_env::with_var("MAX_BATCH_CLAIM", Some("10"), || {
            assert_eq!(max_batch_claim(), 10);
        });
    }

    #[test]
    fn geometry_reads_overrides_and_rejects_inconsistent_values() {
        temp_env::with_vars(
            [
                ("WORLD_SIZE", Some("2000")),
                ("GRID_STEP", Some("20")),
                ("CHUNK_SIZE", Some("500")),
            ],
            || {
                let geometry = grid_geometry();
                assert_eq!(geometry.world_size, 2000);
                assert_eq!(geometry.chunk_size, 500);
            },
        );
        temp_env::with_vars(
            [
                ("WORLD_SIZE", Some("63240")),
                ("GRID_STEP", Some("20")),
                ("CHUNK_SIZE", Some("1010")),
            ],
            || {
                assert_eq!(grid_geometry(), GridGeometry::default());
            },
        );
    }
}
