use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use yard_adapters::{
    jacks_adapter, lkq_adapter, picknpull_adapter, pullapart_adapter, pullnsave_adapter,
    tearapart_adapter, upullandsave_adapter, utpap_adapter, AdapterContext, AdapterError,
    PartitionTarget, SkipReason, SourceAdapter,
};
use yard_core::{RawListing, VehicleRecord};
use yard_storage::{HttpMethod, ReplayTransport, RequestBody, RetryPolicy};

fn fixture(source_id: &str, name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures")
        .join(source_id)
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn context(transport: &Arc<ReplayTransport>) -> AdapterContext {
    AdapterContext::new(transport.clone(), RetryPolicy::single_attempt())
}

fn normalize_all(
    adapter: &dyn SourceAdapter,
    target: &PartitionTarget,
    raws: &[RawListing],
) -> (Vec<VehicleRecord>, Vec<SkipReason>) {
    let mut records = Vec::new();
    let mut skips = Vec::new();
    for raw in raws {
        match adapter.normalize(target, raw) {
            Ok(record) => records.push(record),
            Err(reason) => skips.push(reason),
        }
    }
    (records, skips)
}

#[tokio::test]
async fn jacks_table_filters_make_and_synthesizes_keys() {
    let transport = Arc::new(ReplayTransport::new().respond(
        "https://jacksusedautoparts.com/",
        200,
        fixture("jacks", "listing.html"),
    ));
    let adapter = jacks_adapter();
    let target = PartitionTarget::new("jacks");
    let raws = adapter.fetch_listing(&context(&transport), &target).await.unwrap();
    assert_eq!(raws.len(), 5);

    let (records, skips) = normalize_all(&adapter, &target, &raws);
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].stock_num, "1984Mercedes-Benz300DTan3.0L L5B1205/01/2024");
    assert_eq!(records[0].make.as_deref(), Some("MERCEDES-BENZ"));
    assert_eq!(records[0].details.get("engine").map(String::as_str), Some("3.0L L5"));
    assert_eq!(records[1].model, "E-CLASS");

    assert_eq!(skips.len(), 2);
    assert!(skips.iter().any(|s| !s.is_failure()), "the Ford row is out of scope");
    assert!(skips.iter().any(|s| matches!(s, SkipReason::InvalidYear(y) if y == "19??")));
}

#[tokio::test]
async fn utpap_builds_images_from_stock_numbers() {
    let transport = Arc::new(ReplayTransport::new().respond(
        "https://utpap.com/",
        200,
        fixture("utpap", "listing.html"),
    ));
    let adapter = utpap_adapter();
    let target = PartitionTarget::new("utpap").with_location("Orem");
    let raws = adapter.fetch_listing(&context(&transport), &target).await.unwrap();
    let (records, skips) = normalize_all(&adapter, &target, &raws);

    assert!(skips.is_empty());
    assert_eq!(records.len(), 3);
    assert_eq!(
        records[0].image.as_deref(),
        Some("https://utpap.com/Orem-inventory-photos/U1001.jpeg")
    );
    assert_eq!(records[1].date_listed.as_deref(), Some("2024-04-29"));
    assert_eq!(records[2].location.as_deref(), Some("Orem"));
}

#[tokio::test]
async fn pullnsave_posts_store_form_and_reads_first_cell_image() {
    let transport = Arc::new(ReplayTransport::new().respond(
        "https://pullnsave.com/wp-admin/admin-ajax.php",
        200,
        fixture("pullnsave", "listing.html"),
    ));
    let adapter = pullnsave_adapter();
    let target = PartitionTarget::new("pullnsave-6").with_param("store_id", "6");
    let raws = adapter.fetch_listing(&context(&transport), &target).await.unwrap();

    let request = &transport.requests()[0];
    assert_eq!(request.method, HttpMethod::Post);
    let RequestBody::Form(body) = &request.body else {
        panic!("form body expected");
    };
    assert!(body.contains("store=6&"));

    let (records, _) = normalize_all(&adapter, &target, &raws);
    assert_eq!(records[0].stock_num, "P-5501");
    assert_eq!(records[0].vin.as_deref(), Some("WDBJF65F4WA123456"));
    assert_eq!(records[0].location.as_deref(), Some("Pull-N-Save Salt Lake"));
    assert_eq!(records[0].image.as_deref(), Some("https://pullnsave.com/photos/P-5501.jpg"));
    assert_eq!(records[1].image, None);
}

#[tokio::test]
async fn picknpull_reads_first_entry_vehicles() {
    let transport = Arc::new(ReplayTransport::new().respond(
        "https://www.picknpull.com/api/vehicle/search",
        200,
        fixture("picknpull", "search.json"),
    ));
    let adapter = picknpull_adapter();
    let target = PartitionTarget::new("picknpull");
    let raws = adapter.fetch_listing(&context(&transport), &target).await.unwrap();
    let (records, skips) = normalize_all(&adapter, &target, &raws);

    assert!(skips.is_empty());
    assert_eq!(records[0].stock_num, "PNP-0001");
    assert_eq!(records[0].location.as_deref(), Some("Columbus"));
    assert_eq!(records[1].year, 2005);
    assert_eq!(records[1].image, None);
    assert_eq!(transport.requests()[0].method, HttpMethod::Post);
}

#[tokio::test]
async fn picknpull_missing_vehicles_key_is_fatal() {
    let transport = Arc::new(ReplayTransport::new().respond(
        "https://www.picknpull.com/api/vehicle/search",
        200,
        r#"[{"error":"maintenance"}]"#,
    ));
    let err = picknpull_adapter()
        .fetch_listing(&context(&transport), &PartitionTarget::new("picknpull"))
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Shape { .. }));
}

#[tokio::test]
async fn tearapart_falls_back_to_hol_model() {
    let transport = Arc::new(ReplayTransport::new().respond(
        "https://tearapart.com/",
        200,
        fixture("tearapart", "products.json"),
    ));
    let adapter = tearapart_adapter();
    let target = PartitionTarget::new("tearapart");
    let raws = adapter.fetch_listing(&context(&transport), &target).await.unwrap();
    let (records, _) = normalize_all(&adapter, &target, &raws);

    assert_eq!(records[0].model, "380SL");
    assert_eq!(records[0].vin.as_deref(), Some("WDBBA45C1FA000003"));
    assert_eq!(records[0].image.as_deref(), Some("https://tearapart.com/images/T-301.jpg"));
    assert_eq!(records[1].model, "E-CLASS");
    assert_eq!(records[1].image, None);
}

#[tokio::test]
async fn pullapart_concatenates_locations_and_keys_by_vin_id() {
    let transport = Arc::new(ReplayTransport::new().respond(
        "https://inventoryservice.pullapart.com/Vehicle/Search",
        200,
        fixture("pullapart", "search.json"),
    ));
    let adapter = pullapart_adapter();
    let target = PartitionTarget::new("pullapart");
    let raws = adapter.fetch_listing(&context(&transport), &target).await.unwrap();
    let (records, _) = normalize_all(&adapter, &target, &raws);

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].stock_num, "900001");
    assert_eq!(records[0].row.as_deref(), Some("112"));
    assert_eq!(records[1].location.as_deref(), Some("Nashville"));
    assert_eq!(records[1].details.get("location_id").map(String::as_str), Some("8"));
    assert!(matches!(transport.requests()[0].body, RequestBody::Json(_)));
}

#[tokio::test]
async fn upullandsave_learns_total_then_fetches_remainder_once() {
    let transport = Arc::new(
        ReplayTransport::new()
            .respond(
                "https://upullandsave.com/",
                200,
                fixture("upullandsave", "page-1.json"),
            )
            .respond(
                "https://upullandsave.com/",
                200,
                fixture("upullandsave", "page-2.json"),
            ),
    );
    let adapter = upullandsave_adapter();
    let target = PartitionTarget::new("upullandsave").with_location("Hebron");
    let raws = adapter.fetch_listing(&context(&transport), &target).await.unwrap();
    assert_eq!(raws.len(), 3);

    let bodies: Vec<String> = transport
        .requests()
        .into_iter()
        .map(|r| match r.body {
            RequestBody::Form(body) => body,
            other => panic!("unexpected body {other:?}"),
        })
        .collect();
    assert_eq!(bodies.len(), 2);
    assert!(bodies[0].contains("&start=0&length=10&"));
    assert!(bodies[1].contains("&start=1&length=2&"));

    let (records, _) = normalize_all(&adapter, &target, &raws);
    assert_eq!(records[0].image.as_deref(), Some("https://upullandsave.com/img/H-7001-1.jpg"));
    assert_eq!(records[0].image_urls.len(), 2);
    assert_eq!(records[1].image, None);
    assert_eq!(records[2].location.as_deref(), Some("Hebron"));
}

#[tokio::test]
async fn lkq_advances_pages_until_end_marker() {
    let base = "https://www.lkqpickyourpart.com/DesktopModules/pyp_vehicleInventory/getVehicleInventory.aspx";
    let transport = Arc::new(
        ReplayTransport::new()
            .respond(&format!("{base}?page=1&"), 200, fixture("lkq", "page-1.html"))
            .respond(&format!("{base}?page=2&"), 200, fixture("lkq", "page-2.html")),
    );
    let adapter = lkq_adapter();
    let target = PartitionTarget::new("lkq-dayton")
        .with_location("dayton")
        .with_param("store_id", "1257");
    let raws = adapter.fetch_listing(&context(&transport), &target).await.unwrap();
    assert_eq!(raws.len(), 4);

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].url.ends_with("page=2&filter=mercedes&store=1257"));
    assert!(requests[0]
        .headers
        .contains(&("referer".to_string(), "https://www.lkqpickyourpart.com/inventory/dayton-1257/?search=mercedes".to_string())));

    let (records, skips) = normalize_all(&adapter, &target, &raws);
    assert_eq!(records.len(), 3);
    let first = &records[0];
    assert_eq!((first.year, first.model.as_str()), (2000, "E430"));
    assert_eq!(first.stock_num, "L-100");
    assert_eq!(first.vin.as_deref(), Some("WDBJF70J0YB000010"));
    assert_eq!(first.date_listed.as_deref(), Some("2024-05-01T08:00:00"));
    assert_eq!(first.row.as_deref(), Some("18"));
    assert_eq!(first.details.get("space").map(String::as_str), Some("4"));
    assert_eq!(first.image_urls.len(), 2);
    assert_eq!(first.location.as_deref(), Some("dayton"));
    assert_eq!(records[1].image, None);

    assert_eq!(skips.len(), 1);
    assert!(matches!(skips[0], SkipReason::Malformed(_)));
}

#[tokio::test]
async fn lkq_page_without_rows_or_end_marker_is_fatal() {
    let transport = Arc::new(ReplayTransport::new().respond(
        "https://www.lkqpickyourpart.com/",
        200,
        "<html><body>Service unavailable</body></html>",
    ));
    let err = lkq_adapter()
        .fetch_listing(
            &context(&transport),
            &PartitionTarget::new("lkq-dayton").with_param("store_id", "1257"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Shape { .. }));
}

#[tokio::test]
async fn lkq_stops_at_page_limit() {
    let transport = Arc::new(ReplayTransport::new().respond(
        "https://www.lkqpickyourpart.com/",
        200,
        fixture("lkq", "page-1.html"),
    ));
    let err = lkq_adapter()
        .with_max_pages(3)
        .fetch_listing(&context(&transport), &PartitionTarget::new("lkq-dayton"))
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Message(_)));
    assert_eq!(transport.requests().len(), 3);
}

#[tokio::test]
async fn base_fetch_failure_surfaces_as_fetch_error() {
    let transport = Arc::new(ReplayTransport::new().respond("https://jacksusedautoparts.com/", 503, ""));
    let err = jacks_adapter()
        .fetch_listing(&context(&transport), &PartitionTarget::new("jacks"))
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Fetch(_)));
}

#[tokio::test]
async fn retry_policy_covers_base_fetch_but_not_enrichment() {
    let transport = Arc::new(
        ReplayTransport::new()
            .respond("https://www.picknpull.com/api/vehicle/search", 503, "")
            .respond("https://www.picknpull.com/api/vehicle/WDB", 503, ""),
    );
    let ctx = AdapterContext::new(
        transport.clone(),
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::ZERO,
        },
    );
    let adapter = picknpull_adapter();

    let err = adapter
        .fetch_listing(&ctx, &PartitionTarget::new("picknpull"))
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Fetch(_)));
    assert_eq!(transport.requests().len(), 3);

    let mut record = VehicleRecord::new("picknpull", "PNP-1", 1999, "E-CLASS");
    record.vin = Some("WDBJF65J1YB123456".into());
    let result = adapter
        .enrich(&ctx, &RawListing::Json(serde_json::json!({})), &record)
        .await;
    assert!(result.is_err());
    assert_eq!(transport.requests().len(), 4, "one attempt for the detail call");
}

#[tokio::test]
async fn upullandsave_full_first_page_without_total_is_fatal() {
    let rows: Vec<_> = (0..10)
        .map(|i| serde_json::json!({ "year": "1999", "model": "E-CLASS", "stock_number": format!("S{i}") }))
        .collect();
    let transport = Arc::new(ReplayTransport::new().respond(
        "https://upullandsave.com/",
        200,
        serde_json::json!({ "data": rows }).to_string(),
    ));
    let err = upullandsave_adapter()
        .fetch_listing(&context(&transport), &PartitionTarget::new("upullandsave"))
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Shape { .. }), "{err}");
    assert_eq!(transport.requests().len(), 1);
}
