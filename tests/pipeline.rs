//! Boundary document through tile enumeration to the result logs.

use std::{collections::HashSet, time::Duration};

use geo::{Intersects, MultiPolygon, Polygon};
use rand::Rng;
use serde_json::json;
use tiler_bench::{
    benchmark::{measure, BenchmarkOptions, TileFetcher},
    boundary::{parse_collection, resolve, Boundary, FeatureKind},
    sink::{benchmark_log, FAILED_MARKER},
    tiles::{enumerate, tasks, TileCoordinate, UrlTemplate},
    Error, Result,
};

/// Serves every tile after a short delay except those in `failing`.
struct FlakyServer {
    failing: HashSet<String>,
}

impl TileFetcher for FlakyServer {
    async fn fetch(&self, url: &str) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if self.failing.contains(url) {
            Err(Error::Http(format!("HTTP 503 from {url}")))
        } else {
            Ok(())
        }
    }
}

fn washington_dc() -> String {
    json!({
        "type": "FeatureCollection",
        "features": [{
            "type": "Feature",
            "properties": { "name": "District of Columbia" },
            "geometry": {
                "type": "Polygon",
                "coordinates": [[
                    [-77.119759, 38.934343], [-77.041018, 38.995548], [-76.909395, 38.892580],
                    [-77.039006, 38.791645], [-77.119759, 38.934343]
                ]]
            }
        }]
    })
    .to_string()
}

#[tokio::test(start_paused = true)]
async fn benchmark_run_logs_every_enumerated_tile() {
    let collection = parse_collection(&washington_dc()).unwrap();
    let boundary = resolve(&collection, FeatureKind::Polygon, 0.0).unwrap();
    let zoom_levels = [8, 9, 10];
    let tiles = enumerate(boundary.as_ref(), &zoom_levels).unwrap();
    assert!(!tiles.is_empty());

    let template = UrlTemplate::default();
    let tasks = tasks(&tiles, Some(&template));
    let failing = tasks[tasks.len() - 1].url.clone().unwrap();
    let server = FlakyServer {
        failing: HashSet::from([failing.clone()]),
    };

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dc_tile_response_times.csv");
    let mut log = benchmark_log(&path).unwrap();
    let summary = measure(&server, &tasks, &zoom_levels, &mut log, &BenchmarkOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.total(), tiles.len());
    assert_eq!(summary.failed, 1);

    let mut reader = csv::Reader::from_path(&path).unwrap();
    let rows: Vec<csv::StringRecord> = reader.records().map(|row| row.unwrap()).collect();
    assert_eq!(rows.len(), tiles.len());
    for (row, task) in rows.iter().zip(&tasks) {
        assert_eq!(&row[0], task.url.as_deref().unwrap());
        assert_eq!(row[4].parse::<u8>().unwrap(), task.tile.z);
        if row[0] == failing {
            assert_eq!(&row[3], FAILED_MARKER);
        } else {
            assert!(row[3].parse::<f64>().unwrap() > 0.0);
        }
    }
}

#[test]
fn empty_collection_yields_no_tiles() {
    let collection = parse_collection(r#"{ "type": "FeatureCollection", "features": [] }"#).unwrap();
    let boundary = resolve(&collection, FeatureKind::Polygon, 0.0).unwrap();
    assert!(boundary.is_none());
    assert!(enumerate(boundary.as_ref(), &[8, 9, 10]).unwrap().is_empty());
}

#[test]
fn enumeration_matches_exhaustive_search() {
    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        let (lon, lat) = (rng.gen_range(-170.0..160.0), rng.gen_range(-70.0..60.0));
        let ring: Vec<(f64, f64)> = vec![
            (lon, lat),
            (lon + rng.gen_range(1.0..10.0), lat + rng.gen_range(0.0..2.0)),
            (lon + rng.gen_range(0.0..3.0), lat + rng.gen_range(2.0..10.0)),
            (lon, lat),
        ];
        let boundary = Boundary::new(MultiPolygon::new(vec![Polygon::new(ring.into(), vec![])])).unwrap();

        for zoom in 0..=6u8 {
            let found: HashSet<TileCoordinate> =
                enumerate(Some(&boundary), &[zoom]).unwrap().into_iter().collect();
            let n = 1u32 << zoom;
            let expected: HashSet<TileCoordinate> = (0..n)
                .flat_map(|x| (0..n).map(move |y| TileCoordinate::new(zoom, x, y).unwrap()))
                .filter(|tile| tile.footprint().intersects(boundary.geometry()))
                .collect();
            assert_eq!(found, expected, "zoom {zoom}");
        }
    }
}

#[test]
fn buffered_points_cover_their_own_tile() {
    let collection = parse_collection(
        &json!({
            "type": "FeatureCollection",
            "features": [
                { "type": "Feature", "properties": {}, "geometry": { "type": "Point", "coordinates": [-77.0365, 38.8977] } },
                { "type": "Feature", "properties": {}, "geometry": { "type": "Point", "coordinates": [2.2945, 48.8584] } }
            ]
        })
        .to_string(),
    )
    .unwrap();
    let boundary = resolve(&collection, FeatureKind::Point, 0.001).unwrap();
    let tiles = enumerate(boundary.as_ref(), &[4]).unwrap();

    // one tiny disk per point, each well inside a single zoom 4 tile
    assert_eq!(
        tiles,
        vec![
            TileCoordinate::new(4, 4, 6).unwrap(),
            TileCoordinate::new(4, 8, 5).unwrap(),
        ]
    );
}
