use std::fs;
use std::path::{Path, PathBuf};

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::{cycle, json_encoded};
use httptest::{Expectation, Server};
use secrecy::SecretString;
use serde_json::{json, Value};
use tempfile::tempdir;

use visited_countries::aggregate::CountryAggregate;
use visited_countries::place::FailureReason;
use visited_countries::{run, AppConfig, GeocodingService, RunOptions, TrackedCountries};

const SAVED_PLACES: &str = "Title,URL\n\
Marienplatz,\"https://www.google.com/maps/search/48.1351,11.582\"\n\
Story Bridge,\"https://www.google.com/maps/search/-27.4698,153.0251\"\n\
Uluru,\n\
Hoan Kiem,https://www.google.com/maps/place/Hanoi/data=!4m2!3m1!1s0x3135ab9bd9861ca1:0xe7887f7b72ca17a9\n\
Atlantis,\n";

fn config(dir: &Path, api_base: String) -> AppConfig {
    AppConfig {
        google_maps_api_key: Some(SecretString::from("test-key")),
        google_maps_api_base: api_base,
        geocoder_min_interval_ms: 0,
        geocoder_timeout_secs: 2,
        cache_dir: dir.join("cache"),
        output_dir: dir.join("build"),
        shared_cache_file_name: "shared_hex_coord_cache.json".into(),
        tracked_countries: TrackedCountries::default(),
    }
}

fn write_input(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn geocode_ok(components: Value, lat: f64, lng: f64) -> Value {
    json!({
        "status": "OK",
        "results": [{
            "address_components": components,
            "geometry": {"location": {"lat": lat, "lng": lng}}
        }]
    })
}

fn expect_geocode(server: &Server, param: (&'static str, &'static str), body: Value) {
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/maps/api/geocode/json"),
            request::query(url_decoded(contains(param))),
            request::query(url_decoded(contains(("key", "test-key"))))
        ))
        .times(1)
        .respond_with(json_encoded(body)),
    );
}

#[tokio::test]
async fn resolves_export_once_and_reuses_cache() {
    let server = Server::run();
    expect_geocode(
        &server,
        ("latlng", "48.1351,11.582"),
        geocode_ok(
            json!([
                {"long_name": "Munich", "short_name": "Munich", "types": ["locality"]},
                {"long_name": "Bavaria", "short_name": "BY", "types": ["administrative_area_level_1"]},
                {"long_name": "Germany", "short_name": "DE", "types": ["country", "political"]}
            ]),
            48.1371,
            11.5754,
        ),
    );
    expect_geocode(
        &server,
        ("latlng", "-27.4698,153.0251"),
        geocode_ok(
            json!([
                {"long_name": "Queensland", "short_name": "QLD", "types": ["administrative_area_level_1"]},
                {"long_name": "Australia", "short_name": "AU", "types": ["country"]}
            ]),
            -27.4698,
            153.0251,
        ),
    );
    expect_geocode(
        &server,
        ("address", "Uluru"),
        geocode_ok(
            json!([{"long_name": "Australia", "short_name": "AU", "types": ["country"]}]),
            -25.3444,
            131.0369,
        ),
    );
    expect_geocode(
        &server,
        ("address", "Atlantis"),
        json!({"status": "ZERO_RESULTS", "results": []}),
    );

    let dir = tempdir().unwrap();
    let config = config(dir.path(), server.url_str("/maps/api"));
    let options = RunOptions::new(
        write_input(dir.path(), "Saved Places.csv", SAVED_PLACES),
        &config,
    );
    let lookup = GeocodingService::new(&config).unwrap();

    let first = run(&config, &options, lookup.clone(), None).await.unwrap();
    assert_eq!(first.stats.api_calls, 4);
    assert_eq!(first.stats.short_circuits, 1);

    let countries: Vec<CountryAggregate> =
        serde_json::from_str(&fs::read_to_string(&first.paths.countries).unwrap()).unwrap();
    assert_eq!(countries.len(), 2);
    assert_eq!(countries[0].country, "Germany");
    assert!(countries[0].states.is_empty());
    assert_eq!(countries[0].locations[0].lat, "48.137100");
    let australia = &countries[1];
    assert_eq!(australia.country, "Australia");
    assert_eq!(australia.count, 2);
    assert_eq!(australia.states.len(), 1);
    assert_eq!(australia.states[0].name, "Queensland");
    assert_eq!(australia.states[0].code.as_deref(), Some("QLD"));
    assert_eq!(australia.locations.len(), 2);

    let failed: Value =
        serde_json::from_str(&fs::read_to_string(&first.paths.failed_lookups).unwrap()).unwrap();
    assert_eq!(failed.as_array().unwrap().len(), 2);
    assert_eq!(failed[0]["title"], "Hoan Kiem");
    assert_eq!(failed[0]["reason"], "ambiguous-identifier");
    assert_eq!(failed[1]["title"], "Atlantis");
    assert_eq!(failed[1]["reason"], "no-match");

    let shared = fs::read_to_string(&first.paths.shared_cache).unwrap();
    assert!(shared.contains("\"schema_id\": 5"));
    assert!(shared.contains("hex:0x3135ab9bd9861ca1:0xe7887f7b72ca17a9"));
    assert!(!shared.contains("Uluru"));
    let place_names = fs::read_to_string(&first.paths.place_cache).unwrap();
    assert!(place_names.contains("Uluru"));
    assert!(place_names.contains("Atlantis"));

    let first_countries = fs::read(&first.paths.countries).unwrap();
    let first_failed = fs::read(&first.paths.failed_lookups).unwrap();

    let second = run(&config, &options, lookup, None).await.unwrap();
    assert_eq!(second.stats.api_calls, 0);
    assert_eq!(second.stats.cache_hits, 5);
    assert_eq!(fs::read(&second.paths.countries).unwrap(), first_countries);
    assert_eq!(fs::read(&second.paths.failed_lookups).unwrap(), first_failed);
}

#[tokio::test]
async fn retries_unreachable_provider_on_next_run() {
    let dir = tempdir().unwrap();
    let input = write_input(
        dir.path(),
        "Trip.csv",
        "Title,URL\nLisbon,\"https://www.google.com/maps/search/38.7223,-9.1393\"\n",
    );

    // Nothing listens on the discard port.
    let offline = config(dir.path(), "http://127.0.0.1:9/maps/api".into());
    let options = RunOptions::new(&input, &offline);
    let report = run(
        &offline,
        &options,
        GeocodingService::new(&offline).unwrap(),
        None,
    )
    .await
    .unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].reason, FailureReason::TransientNetwork);
    let shared_cache = report.paths.shared_cache.clone();
    assert!(
        !shared_cache.exists()
            || !fs::read_to_string(&shared_cache)
                .unwrap()
                .contains("38.722300,-9.139300")
    );

    let server = Server::run();
    expect_geocode(
        &server,
        ("latlng", "38.7223,-9.1393"),
        geocode_ok(
            json!([{"long_name": "Portugal", "short_name": "PT", "types": ["country"]}]),
            38.7223,
            -9.1393,
        ),
    );
    let online = config(dir.path(), server.url_str("/maps/api"));
    let report = run(
        &online,
        &RunOptions::new(&input, &online),
        GeocodingService::new(&online).unwrap(),
        None,
    )
    .await
    .unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(report.countries[0].country, "Portugal");
    assert_eq!(
        fs::read_to_string(&report.paths.failed_lookups).unwrap().trim(),
        "[]"
    );
}

#[tokio::test]
async fn looks_up_customer_ids_through_place_details() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/maps/api/place/details/json"),
            request::query(url_decoded(contains(("cid", "10222232094831998944")))),
            request::query(url_decoded(contains(("fields", "address_components,geometry"))))
        ))
        .times(2)
        .respond_with(cycle![
            json_encoded(json!({
                "status": "OVER_QUERY_LIMIT",
                "error_message": "You have exceeded your daily request quota."
            })),
            json_encoded(json!({
                "status": "OK",
                "result": {
                    "address_components": [
                        {"long_name": "Chile", "short_name": "CL", "types": ["country"]}
                    ],
                    "geometry": {"location": {"lat": -33.4489, "lng": -70.6693}}
                }
            })),
        ]),
    );

    let dir = tempdir().unwrap();
    let config = config(dir.path(), server.url_str("/maps/api"));
    let input = write_input(
        dir.path(),
        "Santiago.csv",
        "Title,URL\nCerro San Cristóbal,https://www.google.com/maps?ftid=0x47e66e2964e34e2d:0x8ddca9ee380ef7e0\n",
    );
    let options = RunOptions::new(&input, &config);
    let lookup = GeocodingService::new(&config).unwrap();

    let throttled = run(&config, &options, lookup.clone(), None).await.unwrap();
    assert_eq!(throttled.failed[0].reason, FailureReason::ProviderError);
    assert!(throttled.countries.is_empty());

    let resolved = run(&config, &options, lookup, None).await.unwrap();
    assert!(resolved.failed.is_empty());
    assert_eq!(resolved.countries[0].country, "Chile");
    assert_eq!(resolved.countries[0].locations[0].lng, "-70.669300");
}

#[tokio::test]
async fn migrates_previous_cache_generation_without_refetching() {
    // No expectations: any request fails the test.
    let server = Server::run();
    let dir = tempdir().unwrap();
    let config = config(dir.path(), server.url_str("/maps/api"));
    fs::create_dir_all(&config.cache_dir).unwrap();
    let shared_path = config.cache_dir.join("shared_hex_coord_cache.json");
    fs::write(
        &shared_path,
        serde_json::to_string_pretty(&json!({
            "schema_version": 4,
            "30.267200,-97.743100": {
                "country": "United States",
                "state": {"name": "Texas", "short_name": "TX"},
                "lat": 30.2672,
                "lng": -97.7431
            }
        }))
        .unwrap(),
    )
    .unwrap();

    let input = write_input(
        dir.path(),
        "Road trip.csv",
        "Title,URL\nCapitol,\"https://www.google.com/maps/search/30.2672,-97.7431\"\n",
    );
    let report = run(
        &config,
        &RunOptions::new(&input, &config),
        GeocodingService::new(&config).unwrap(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.stats.api_calls, 0);
    assert_eq!(report.migrations.files.len(), 1);
    assert_eq!(report.migrations.files[0].from_schema, 4);
    assert!(report.migrations.files[0].backup.exists());

    let migrated: Value =
        serde_json::from_str(&fs::read_to_string(&shared_path).unwrap()).unwrap();
    assert_eq!(migrated["schema_id"], 5);
    assert!(!migrated.to_string().contains("short_name"));
    assert_eq!(
        migrated["entries"]["30.267200,-97.743100"]["state"]["code"],
        "TX"
    );

    let united_states = &report.countries[0];
    assert_eq!(united_states.country, "United States");
    assert_eq!(united_states.states[0].code.as_deref(), Some("TX"));
}

#[tokio::test]
async fn aborts_before_processing_when_cache_cannot_migrate() {
    let dir = tempdir().unwrap();
    let config = config(dir.path(), "http://127.0.0.1:9/maps/api".into());
    fs::create_dir_all(&config.cache_dir).unwrap();
    let place_cache = config.cache_dir.join("Broken_place_names.json");
    fs::write(&place_cache, r#"{"schema_version": 2, "Paris": ["France"]}"#).unwrap();

    let input = write_input(dir.path(), "Broken.csv", "Title,URL\nParis,\n");
    let err = run(
        &config,
        &RunOptions::new(&input, &config),
        GeocodingService::new(&config).unwrap(),
        None,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("cache migration failed"));
    assert!(!config.output_dir.join("Broken_countries.json").exists());
    assert_eq!(
        fs::read_to_string(&place_cache).unwrap(),
        r#"{"schema_version": 2, "Paris": ["France"]}"#
    );
}
