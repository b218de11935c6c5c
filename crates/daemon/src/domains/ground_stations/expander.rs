use std::{collections::HashSet, f64::consts::PI, sync::Arc, time::Duration};

use slog::{debug, info, warn, Logger};
use tokio::{sync::mpsc, task::JoinSet, time::timeout};

use crate::{
    destination_point, haversine_distance, Coordinate, FusionError, GroundStationSource,
    StationSummary,
};

/// Share of the sub-query radius the tiling relies on; the rest is overlap
const COVERAGE_FACTOR: f64 = 0.95;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubQuery {
    pub center: Coordinate,
    pub radius_m: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NearbyStation {
    pub station: StationSummary,
    pub distance_m: f64,
}

/// Split a search disc into sub-queries no larger than `max_radius_m`.
///
/// A centre disc plus concentric rings of discs. Each ring covers an
/// annulus whose width equals the effective sub-radius, with enough centres
/// that neighbouring discs still overlap on both annulus edges.
pub fn expand_query(center: Coordinate, desired_radius_m: f64, max_radius_m: f64) -> Vec<SubQuery> {
    if desired_radius_m <= max_radius_m || max_radius_m <= 0.0 {
        return vec![SubQuery {
            center,
            radius_m: desired_radius_m,
        }];
    }

    let effective = max_radius_m * COVERAGE_FACTOR;
    let mut queries = vec![SubQuery {
        center,
        radius_m: max_radius_m,
    }];

    let mut inner = effective;
    while inner < desired_radius_m {
        let outer = (inner + effective).min(desired_radius_m);
        let ring_radius = (inner + outer) / 2.0;
        let count = ring_size(inner, outer, ring_radius, effective);

        for i in 0..count {
            let bearing = 360.0 * i as f64 / count as f64;
            queries.push(SubQuery {
                center: destination_point(center, bearing, ring_radius),
                radius_m: max_radius_m,
            });
        }
        inner = outer;
    }
    queries
}

/// Discs of radius `reach` centred on a circle of radius `ring` cover the
/// annulus [inner, outer] when each disc spans at least 2π/n of both edges.
fn ring_size(inner: f64, outer: f64, ring: f64, reach: f64) -> usize {
    let half_angle = |s: f64| {
        let cos = (s * s + ring * ring - reach * reach) / (2.0 * s * ring);
        cos.clamp(-1.0, 1.0).acos()
    };
    let narrowest = half_angle(inner).min(half_angle(outer));
    if narrowest <= 0.0 {
        return 3;
    }
    ((PI / narrowest).ceil() as usize).max(3)
}

/// Run every sub-query concurrently and merge the results.
///
/// A failed or timed-out sub-query contributes nothing. The merge keeps the
/// first occurrence of each station id (in sub-query order), drops stations
/// outside the requested radius and sorts by distance from `center`.
pub async fn fetch_expanded(
    source: Arc<dyn GroundStationSource>,
    center: Coordinate,
    desired_radius_m: f64,
    max_radius_m: f64,
    per_call_timeout: Duration,
    logger: &Logger,
) -> Result<Vec<NearbyStation>, FusionError> {
    let queries = expand_query(center, desired_radius_m, max_radius_m);
    let attempted = queries.len();
    info!(
        logger,
        "searching {:.0} m around {} with {} sub-queries", desired_radius_m, center, attempted
    );

    let (tx, mut rx) = mpsc::channel::<(usize, Result<Vec<StationSummary>, String>)>(attempted);
    let mut set = JoinSet::new();

    for (index, query) in queries.into_iter().enumerate() {
        let tx = tx.clone();
        let source = Arc::clone(&source);
        set.spawn(async move {
            let result = match timeout(
                per_call_timeout,
                source.locations(query.center, query.radius_m),
            )
            .await
            {
                Ok(Ok(stations)) => Ok(stations),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!("timed out after {:?}", per_call_timeout)),
            };
            // receiver only goes away when the whole call is dropped
            let _ = tx.send((index, result)).await;
        });
    }

    // Drop the sender so the channel closes when all tasks complete
    drop(tx);

    let mut batches = Vec::with_capacity(attempted);
    let mut failed = 0;
    while let Some((index, result)) = rx.recv().await {
        match result {
            Ok(stations) => {
                debug!(logger, "sub-query {} returned {} stations", index, stations.len());
                batches.push((index, stations));
            }
            Err(reason) => {
                warn!(logger, "sub-query {} failed: {}", index, reason);
                failed += 1;
            }
        }
    }
    while let Some(joined) = set.join_next().await {
        if let Err(e) = joined {
            warn!(logger, "sub-query task ended abnormally: {}", e);
        }
    }

    if batches.is_empty() {
        return Err(FusionError::AllSubQueriesFailed { attempted });
    }
    if failed > 0 {
        warn!(logger, "{} of {} sub-queries failed", failed, attempted);
    }

    batches.sort_by_key(|(index, _)| *index);
    Ok(merge_stations(
        center,
        desired_radius_m,
        batches.into_iter().flat_map(|(_, stations)| stations),
    ))
}

pub fn merge_stations(
    center: Coordinate,
    desired_radius_m: f64,
    stations: impl IntoIterator<Item = StationSummary>,
) -> Vec<NearbyStation> {
    let mut seen = HashSet::new();
    let mut merged: Vec<NearbyStation> = stations
        .into_iter()
        .filter(|s| seen.insert(s.id))
        .filter_map(|station| {
            let distance_m = haversine_distance(center, station.coordinate);
            (distance_m <= desired_radius_m).then_some(NearbyStation {
                station,
                distance_m,
            })
        })
        .collect();
    merged.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockGroundStationSource;
    use slog::{o, Discard};

    const NYC: Coordinate = Coordinate {
        latitude: 40.7128,
        longitude: -74.0060,
    };

    fn logger() -> Logger {
        Logger::root(Discard, o!())
    }

    fn station(id: i64, coordinate: Coordinate) -> StationSummary {
        StationSummary {
            id,
            name: format!("station {id}"),
            coordinate,
            sensors: Vec::new(),
        }
    }

    fn assert_covers(center: Coordinate, desired: f64, max: f64) {
        let queries = expand_query(center, desired, max);
        assert!(queries.iter().all(|q| q.radius_m <= max));

        let mut samples = vec![center];
        for step in 1..=40 {
            let distance = desired * step as f64 / 40.0;
            for bearing in (0..360).step_by(5) {
                samples.push(destination_point(center, bearing as f64, distance));
            }
        }
        for point in samples {
            let covered = queries
                .iter()
                .any(|q| haversine_distance(q.center, point) <= q.radius_m);
            assert!(covered, "{point} not covered for {desired}/{max}");
        }
    }

    #[test]
    fn small_radius_is_left_alone() {
        let queries = expand_query(NYC, 10_000.0, 25_000.0);
        assert_eq!(
            queries,
            vec![SubQuery {
                center: NYC,
                radius_m: 10_000.0
            }]
        );
    }

    #[test]
    fn hundred_km_over_25km_is_fully_covered() {
        let queries = expand_query(NYC, 100_000.0, 25_000.0);
        assert!(queries.len() > 7);
        assert_covers(NYC, 100_000.0, 25_000.0);
    }

    #[test]
    fn coverage_holds_across_radius_ratios() {
        for desired in [26_000.0, 40_000.0, 49_000.0, 60_000.0, 150_000.0] {
            assert_covers(NYC, desired, 25_000.0);
        }
        assert_covers(Coordinate::new(64.8, -147.7), 80_000.0, 25_000.0);
    }

    #[test]
    fn merge_dedups_filters_and_sorts() {
        let far = destination_point(NYC, 90.0, 60_000.0);
        let near = destination_point(NYC, 0.0, 5_000.0);
        let outside = destination_point(NYC, 180.0, 120_000.0);
        let merged = merge_stations(
            NYC,
            100_000.0,
            vec![
                station(1, far),
                station(2, near),
                station(1, far),
                station(3, outside),
            ],
        );
        let ids: Vec<_> = merged.iter().map(|s| s.station.id).collect();
        assert_eq!(ids, vec![2, 1]);
    }

    #[tokio::test]
    async fn overlapping_sub_queries_yield_unique_stations() {
        let mut source = MockGroundStationSource::new();
        // every sub-query sees the same two stations
        source.expect_locations().returning(|_, _| {
            Ok(vec![
                station(10, destination_point(NYC, 45.0, 20_000.0)),
                station(11, destination_point(NYC, 200.0, 70_000.0)),
            ])
        });

        let stations = fetch_expanded(
            Arc::new(source),
            NYC,
            100_000.0,
            25_000.0,
            Duration::from_secs(5),
            &logger(),
        )
        .await
        .unwrap();

        let ids: Vec<_> = stations.iter().map(|s| s.station.id).collect();
        assert_eq!(ids, vec![10, 11]);
    }

    #[tokio::test]
    async fn partial_failures_are_tolerated() {
        let mut source = MockGroundStationSource::new();
        source.expect_locations().returning(|center, _| {
            if center == NYC {
                Ok(vec![station(1, NYC)])
            } else {
                Err(anyhow::anyhow!("502 bad gateway"))
            }
        });

        let stations = fetch_expanded(
            Arc::new(source),
            NYC,
            60_000.0,
            25_000.0,
            Duration::from_secs(5),
            &logger(),
        )
        .await
        .unwrap();
        assert_eq!(stations.len(), 1);
    }

    #[tokio::test]
    async fn all_sub_queries_failing_is_an_error() {
        let mut source = MockGroundStationSource::new();
        source
            .expect_locations()
            .returning(|_, _| Err(anyhow::anyhow!("connection refused")));

        let err = fetch_expanded(
            Arc::new(source),
            NYC,
            60_000.0,
            25_000.0,
            Duration::from_secs(5),
            &logger(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FusionError::AllSubQueriesFailed { .. }));
    }
}
