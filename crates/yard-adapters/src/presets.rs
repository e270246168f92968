//! Built-in salvage-yard sources, each expressed as configuration of one of the
//! generic adapter shapes.

use yard_core::{ModelMatch, StoreMode};

use crate::{
    HtmlTableAdapter, HtmlTableLayout, JsonFieldMap, JsonImage, JsonListingAdapter, ListingPath,
    NhtsaVinDecoder, PagedHtmlAdapter, PaginatedJsonAdapter, PicknpullDetailLookup,
    PullapartDetailLookup, PullapartImageLookup, RequestTemplate, ResultRowLayout, RowImage,
    SourceAdapter, SourceProfile, StockKey, TemplateBody,
};

pub const PRESET_NAMES: &[&str] = &[
    "jacks",
    "lkq",
    "picknpull",
    "pullapart",
    "pullnsave",
    "tearapart",
    "upullandsave",
    "utpap",
];

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/129.0.0.0 Safari/537.36";

const BROWSER_HEADERS: &[(&str, &str)] = &[("accept", "*/*"), ("user-agent", BROWSER_UA)];

const FORM_HEADERS: &[(&str, &str)] = &[
    ("accept", "*/*"),
    ("content-type", "application/x-www-form-urlencoded; charset=UTF-8"),
    ("user-agent", BROWSER_UA),
];

pub fn jacks_adapter() -> HtmlTableAdapter {
    HtmlTableAdapter::new(
        SourceProfile::new("jacks"),
        RequestTemplate::get("https://jacksusedautoparts.com/vehicleInventory.php"),
        HtmlTableLayout {
            table: "table#vehicles",
            rows: "tbody tr",
            year: 0,
            make: Some(1),
            model: 2,
            stock_num: StockKey::Concat(&[0, 1, 2, 3, 4, 5, 6]),
            color: Some(3),
            vin: None,
            row: Some(5),
            date_listed: Some(6),
            location: None,
            details: &[("engine", 4)],
            image: RowImage::None,
            required_make: Some("MERCEDES"),
        },
    )
}

pub fn utpap_adapter() -> HtmlTableAdapter {
    HtmlTableAdapter::new(
        SourceProfile::new("utpap").store_mode(StoreMode::StoreMatchesOnly),
        RequestTemplate::get("https://utpap.com/search-inventory_orem.php?make=MERCEDES-BENZ&model=")
            .with_headers(BROWSER_HEADERS),
        HtmlTableLayout {
            table: "table#cars-table",
            rows: "tr",
            year: 0,
            make: None,
            model: 2,
            stock_num: StockKey::Column(3),
            color: Some(4),
            vin: None,
            row: Some(6),
            date_listed: Some(8),
            location: None,
            details: &[],
            image: RowImage::Template("https://utpap.com/Orem-inventory-photos/{stock_num}.jpeg"),
            required_make: None,
        },
    )
}

pub fn pullnsave_adapter() -> HtmlTableAdapter {
    HtmlTableAdapter::new(
        SourceProfile::new("pullnsave")
            .model_match(ModelMatch::Contains)
            .store_mode(StoreMode::StoreMatchesOnly)
            .enricher(NhtsaVinDecoder::default()),
        RequestTemplate::post(
            "https://pullnsave.com/wp-admin/admin-ajax.php",
            TemplateBody::Form(
                "makes=Mercedes-Benz&models=0&years=1976&endYears=2002&store={store_id}\
                 &beginDate=&endDate=&action=getVehicles",
            ),
        )
        .with_headers(FORM_HEADERS),
        HtmlTableLayout {
            table: "table#vehicletable1",
            rows: "tbody tr",
            year: 1,
            make: None,
            model: 2,
            stock_num: StockKey::Column(7),
            color: Some(6),
            vin: Some(8),
            row: Some(4),
            date_listed: Some(3),
            location: Some(5),
            details: &[],
            image: RowImage::FirstCellImg,
            required_make: None,
        },
    )
}

pub fn picknpull_adapter() -> JsonListingAdapter {
    JsonListingAdapter::new(
        SourceProfile::new("picknpull").enricher(PicknpullDetailLookup::default()),
        RequestTemplate::post(
            "https://www.picknpull.com/api/vehicle/search?&makeId=182&modelId=0&year=\
             &distance=10&zip=43207&language=english",
            TemplateBody::Empty,
        )
        .with_headers(&[("accept", "application/json, text/plain, */*")]),
        ListingPath::FirstThenKey("vehicles"),
        JsonFieldMap {
            vin: Some("vin"),
            row: Some("row"),
            date_listed: Some("dateAdded"),
            location: Some("locationName"),
            image: JsonImage::Field("imageName"),
            ..JsonFieldMap::new("year", &["model"], "barCodeNumber")
        },
    )
}

pub fn tearapart_adapter() -> JsonListingAdapter {
    JsonListingAdapter::new(
        SourceProfile::new("tearapart")
            .store_mode(StoreMode::StoreMatchesOnly)
            .enricher(NhtsaVinDecoder::default()),
        RequestTemplate::post(
            "https://tearapart.com/wp-admin/admin-ajax.php",
            TemplateBody::Form(
                "sif_form_field_store=SALT+LAKE+CITY&sif_form_field_make=MERCEDES-BENZ\
                 &makes-sorting-order=0&models-sorting-order=0&action=sif_search_products\
                 &sif_verify_request=c41145a606&sorting%5Bkey%5D=iyear&sorting%5Bstate%5D=0\
                 &sorting%5Btype%5D=int",
            ),
        )
        .with_headers(FORM_HEADERS),
        ListingPath::Key("products"),
        JsonFieldMap {
            vin: Some("vin"),
            color: Some("color"),
            row: Some("vehicle_row"),
            date_listed: Some("yard_date"),
            image: JsonImage::EmbeddedHtmlAttr("image_url"),
            ..JsonFieldMap::new("iyear", &["model", "hol_model"], "stocknumber")
        },
    )
}

pub fn pullapart_adapter() -> JsonListingAdapter {
    JsonListingAdapter::new(
        SourceProfile::new("pullapart")
            .enricher(PullapartDetailLookup::default())
            .image_lookup(PullapartImageLookup::default()),
        RequestTemplate::post(
            "https://inventoryservice.pullapart.com/Vehicle/Search",
            TemplateBody::Json(r#"{"Locations":[18,8,35],"MakeID":37,"Models":[],"Years":[]}"#),
        ),
        ListingPath::EachThenKey("exact"),
        JsonFieldMap {
            vin: Some("vin"),
            row: Some("row"),
            date_listed: Some("dateYardOn"),
            location: Some("locName"),
            details: &[("location_id", "locID")],
            ..JsonFieldMap::new("modelYear", &["modelName"], "vinID")
        },
    )
}

pub fn upullandsave_adapter() -> PaginatedJsonAdapter {
    PaginatedJsonAdapter::new(
        SourceProfile::new("upullandsave").enricher(NhtsaVinDecoder::default()),
        RequestTemplate::post(
            "https://upullandsave.com/wp-admin/admin-ajax.php",
            TemplateBody::Form(concat!(
                "draw=1",
                "&columns%5B2%5D%5Bdata%5D=year&columns%5B3%5D%5Bdata%5D=make",
                "&columns%5B4%5D%5Bdata%5D=model&columns%5B5%5D%5Bdata%5D=stock_number",
                "&columns%5B6%5D%5Bdata%5D=color&columns%5B7%5D%5Bdata%5D=yard_row",
                "&columns%5B8%5D%5Bdata%5D=date_set&columns%5B9%5D%5Bdata%5D=vin",
                "&order%5B0%5D%5Bcolumn%5D=8&order%5B0%5D%5Bdir%5D=desc",
                "&start={start}&length={length}",
                "&search%5Bvalue%5D=&search%5Bregex%5D=false",
                "&action=yardsmart_integration&api_call=getInventoryDatatablesArray",
                "&params%5Byard_id%5D=232&params%5Byear%5D=false",
                "&params%5Bmake%5D=MERCEDES-BENZ&params%5Bmodel%5D=false&params%5Blog%5D=true",
            )),
        )
        .with_headers(FORM_HEADERS),
        JsonFieldMap {
            vin: Some("vin"),
            color: Some("color"),
            row: Some("yard_row"),
            date_listed: Some("date_set"),
            image: JsonImage::UrlList {
                key: "images",
                url_key: "url",
            },
            ..JsonFieldMap::new("year", &["model"], "stock_number")
        },
    )
    .with_first_page_length(10)
}

pub fn lkq_adapter() -> PagedHtmlAdapter {
    PagedHtmlAdapter::new(
        SourceProfile::new("lkq").model_match(ModelMatch::Prefix),
        RequestTemplate::get(
            "https://www.lkqpickyourpart.com/DesktopModules/pyp_vehicleInventory/\
             getVehicleInventory.aspx?page={page}&filter=mercedes&store={store_id}",
        )
        .with_headers(&[(
            "referer",
            "https://www.lkqpickyourpart.com/inventory/{location}-{store_id}/?search=mercedes",
        )]),
        ResultRowLayout {
            result_row: "div.pypvi_resultRow",
            end_marker: "div.pypvi_end",
            title: "a.pypvi_ymm",
            detail_item: "div.pypvi_detailItem",
            primary_image: "a.pypvi_image",
            gallery_image: "div.pypvi_images a[href]",
            stock_label: "Stock #",
            color_label: "Color",
            vin_label: "VIN",
            date_label: "Available",
            row_label: "Row",
            details: &[("section", "Section"), ("space", "Space")],
            max_pages: 50,
        },
    )
}

pub fn adapter_for_source(preset: &str) -> Option<Box<dyn SourceAdapter>> {
    match preset {
        "jacks" => Some(Box::new(jacks_adapter())),
        "lkq" => Some(Box::new(lkq_adapter())),
        "picknpull" => Some(Box::new(picknpull_adapter())),
        "pullapart" => Some(Box::new(pullapart_adapter())),
        "pullnsave" => Some(Box::new(pullnsave_adapter())),
        "tearapart" => Some(Box::new(tearapart_adapter())),
        "upullandsave" => Some(Box::new(upullandsave_adapter())),
        "utpap" => Some(Box::new(utpap_adapter())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_preset_name_resolves() {
        for name in PRESET_NAMES {
            let adapter = adapter_for_source(name).expect("preset");
            assert_eq!(adapter.source_id(), *name);
        }
        assert!(adapter_for_source("nope").is_none());
    }

    #[test]
    fn per_source_interest_rules() {
        assert_eq!(lkq_adapter().model_match(), ModelMatch::Prefix);
        assert_eq!(pullnsave_adapter().model_match(), ModelMatch::Contains);
        assert_eq!(jacks_adapter().model_match(), ModelMatch::Exact);
        assert_eq!(utpap_adapter().default_store_mode(), StoreMode::StoreMatchesOnly);
        assert_eq!(picknpull_adapter().default_store_mode(), StoreMode::StoreAll);
    }
}
