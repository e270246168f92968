//! HTML listing shapes: a single table page, and a paged list of result rows that
//! ends at a marker element.

use async_trait::async_trait;
use scraper::node::Node;
use scraper::{ElementRef, Html};
use tracing::{debug, info};
use yard_core::{EnrichmentPatch, ImageRefs, ModelMatch, RawListing, RowListing, StoreMode, VehicleRecord};

use crate::{
    coerce_year, element_text, selector, synthesize_stock_num, text_or_none, AdapterContext,
    AdapterError, EnrichError, PartitionTarget, RequestTemplate, SkipReason, SourceAdapter,
    SourceProfile, SourceShape,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockKey {
    Column(usize),
    /// Concatenation of raw display columns, for sources with no identifier.
    Concat(&'static [usize]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowImage {
    None,
    /// `src` of the first `<img>` in the row's first cell.
    FirstCellImg,
    /// URL built from the stock number, e.g. `https://host/photos/{stock_num}.jpeg`.
    Template(&'static str),
}

/// Column positions for a table whose rows are listings.
#[derive(Debug, Clone, Copy)]
pub struct HtmlTableLayout {
    pub table: &'static str,
    pub rows: &'static str,
    pub year: usize,
    pub make: Option<usize>,
    pub model: usize,
    pub stock_num: StockKey,
    pub color: Option<usize>,
    pub vin: Option<usize>,
    pub row: Option<usize>,
    pub date_listed: Option<usize>,
    pub location: Option<usize>,
    pub details: &'static [(&'static str, usize)],
    pub image: RowImage,
    /// Rows whose make column does not contain this token are out of scope.
    pub required_make: Option<&'static str>,
}

pub struct HtmlTableAdapter {
    profile: SourceProfile,
    request: RequestTemplate,
    layout: HtmlTableLayout,
}

impl HtmlTableAdapter {
    pub fn new(profile: SourceProfile, request: RequestTemplate, layout: HtmlTableLayout) -> Self {
        Self {
            profile,
            request,
            layout,
        }
    }
}

fn parse_table(html: &str, url: &str, layout: &HtmlTableLayout) -> Result<Vec<RawListing>, AdapterError> {
    let document = Html::parse_document(html);
    let table_sel = selector(layout.table)?;
    let row_sel = selector(layout.rows)?;
    let cell_sel = selector("td")?;
    let img_sel = selector("img")?;

    let Some(table) = document.select(&table_sel).next() else {
        return Err(AdapterError::shape(url, format!("no `{}` element", layout.table)));
    };

    let mut listings = Vec::new();
    for row in table.select(&row_sel) {
        let cells: Vec<ElementRef<'_>> = row.select(&cell_sel).collect();
        // Header rows carry only <th>.
        if cells.is_empty() {
            continue;
        }
        let image = match layout.image {
            RowImage::FirstCellImg => cells[0]
                .select(&img_sel)
                .next()
                .and_then(|img| img.value().attr("src"))
                .and_then(text_or_none),
            _ => None,
        };
        listings.push(RawListing::Row(RowListing {
            cells: cells.into_iter().map(element_text).collect(),
            image,
            ..RowListing::default()
        }));
    }
    Ok(listings)
}

fn normalize_table_row(
    layout: &HtmlTableLayout,
    target: &PartitionTarget,
    row: &RowListing,
) -> Result<VehicleRecord, SkipReason> {
    let cell = |index: Option<usize>| index.and_then(|i| row.cell(i)).and_then(text_or_none);

    let year = coerce_year(row.cell(layout.year))?;
    let make = cell(layout.make).map(|m| m.to_ascii_uppercase());
    if let Some(required) = layout.required_make {
        if !make.as_deref().unwrap_or_default().contains(required) {
            return Err(SkipReason::OutOfScope(format!(
                "make {:?}",
                make.unwrap_or_default()
            )));
        }
    }
    let model = cell(Some(layout.model)).ok_or(SkipReason::MissingField("model"))?;
    let stock_num = match layout.stock_num {
        StockKey::Column(index) => {
            cell(Some(index)).ok_or(SkipReason::MissingField("stock_num"))?
        }
        StockKey::Concat(columns) => {
            synthesize_stock_num(columns.iter().map(|i| row.cell(*i).unwrap_or_default()))
        }
    };

    let mut record = VehicleRecord::new(&target.partition_id, stock_num, year, &model);
    record.make = make;
    record.color = cell(layout.color);
    record.vin = cell(layout.vin);
    record.row = cell(layout.row);
    record.date_listed = cell(layout.date_listed);
    record.location = cell(layout.location).or_else(|| target.location.clone());
    for (name, index) in layout.details {
        if let Some(value) = cell(Some(*index)) {
            record.details.insert(name.to_string(), value);
        }
    }
    record.image = match layout.image {
        RowImage::None => None,
        RowImage::FirstCellImg => row.image.clone(),
        RowImage::Template(template) => Some(template.replace("{stock_num}", &record.stock_num)),
    };
    Ok(record)
}

#[async_trait]
impl SourceAdapter for HtmlTableAdapter {
    fn source_id(&self) -> &'static str {
        self.profile.source_id
    }

    fn shape(&self) -> SourceShape {
        SourceShape::HtmlTable
    }

    fn model_match(&self) -> ModelMatch {
        self.profile.model_match
    }

    fn default_store_mode(&self) -> StoreMode {
        self.profile.store_mode
    }

    async fn fetch_listing(
        &self,
        ctx: &AdapterContext,
        target: &PartitionTarget,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let request = self.request.render(&target.template_vars())?;
        let response = ctx.fetch_base(&request).await?;
        let listings = parse_table(&response.text(), &response.final_url, &self.layout)?;
        info!(
            source_id = self.profile.source_id,
            partition = %target.partition_id,
            rows = listings.len(),
            "fetched listing table"
        );
        Ok(listings)
    }

    fn normalize(&self, target: &PartitionTarget, raw: &RawListing) -> Result<VehicleRecord, SkipReason> {
        match raw {
            RawListing::Row(row) => normalize_table_row(&self.layout, target, row),
            RawListing::Json(_) => Err(SkipReason::Malformed("expected a table row".into())),
        }
    }

    async fn enrich(
        &self,
        ctx: &AdapterContext,
        raw: &RawListing,
        record: &VehicleRecord,
    ) -> Result<Option<EnrichmentPatch>, EnrichError> {
        self.profile.enrich(ctx, raw, record).await
    }

    async fn lookup_image(
        &self,
        ctx: &AdapterContext,
        raw: &RawListing,
    ) -> Result<Option<ImageRefs>, EnrichError> {
        self.profile.lookup_image(ctx, raw).await
    }
}

/// Selectors and detail labels for a result-row listing split across pages.
#[derive(Debug, Clone, Copy)]
pub struct ResultRowLayout {
    pub result_row: &'static str,
    pub end_marker: &'static str,
    /// Element whose text reads `YEAR MAKE MODEL`.
    pub title: &'static str,
    /// Containers of `<b>Label:</b> value` pairs.
    pub detail_item: &'static str,
    pub primary_image: &'static str,
    pub gallery_image: &'static str,
    pub stock_label: &'static str,
    pub color_label: &'static str,
    pub vin_label: &'static str,
    pub date_label: &'static str,
    pub row_label: &'static str,
    pub details: &'static [(&'static str, &'static str)],
    pub max_pages: usize,
}

pub struct PagedHtmlAdapter {
    profile: SourceProfile,
    request: RequestTemplate,
    layout: ResultRowLayout,
}

impl PagedHtmlAdapter {
    pub fn new(profile: SourceProfile, request: RequestTemplate, layout: ResultRowLayout) -> Self {
        Self {
            profile,
            request,
            layout,
        }
    }

    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.layout.max_pages = max_pages;
        self
    }
}

struct ResultPage {
    rows: Vec<RawListing>,
    ended: bool,
}

fn parse_result_page(html: &str, layout: &ResultRowLayout) -> Result<ResultPage, AdapterError> {
    let document = Html::parse_document(html);
    let row_sel = selector(layout.result_row)?;
    let end_sel = selector(layout.end_marker)?;
    let title_sel = selector(layout.title)?;
    let detail_sel = selector(layout.detail_item)?;
    let bold_sel = selector("b")?;
    let time_sel = selector("time")?;
    let primary_sel = selector(layout.primary_image)?;
    let gallery_sel = selector(layout.gallery_image)?;

    let mut rows = Vec::new();
    for row in document.select(&row_sel) {
        let title = row
            .select(&title_sel)
            .next()
            .map(|t| {
                t.text()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();

        let mut listing = RowListing {
            cells: vec![title],
            ..RowListing::default()
        };
        for detail in row.select(&detail_sel) {
            for bold in detail.select(&bold_sel) {
                let label = element_text(bold).trim_end_matches(':').trim().to_string();
                let mut value = labelled_value(bold);
                if label == layout.date_label {
                    if let Some(time) = detail.select(&time_sel).next() {
                        value = time
                            .value()
                            .attr("datetime")
                            .map(str::to_string)
                            .unwrap_or_else(|| element_text(time));
                    }
                }
                listing.labels.insert(label, value);
            }
        }
        listing.image = row
            .select(&primary_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(text_or_none);
        listing.image_urls = row
            .select(&gallery_sel)
            .filter_map(|a| a.value().attr("href"))
            .filter_map(text_or_none)
            .collect();
        rows.push(RawListing::Row(listing));
    }

    let ended = document.select(&end_sel).next().is_some();
    Ok(ResultPage { rows, ended })
}

/// Text that follows a `<b>` label up to the next non-`<br>` element.
fn labelled_value(label: ElementRef<'_>) -> String {
    let mut value = String::new();
    let mut next = label.next_sibling();
    while let Some(node) = next {
        match node.value() {
            Node::Text(text) => value.push_str(text.trim()),
            Node::Element(el) if el.name() == "br" => {}
            _ => break,
        }
        next = node.next_sibling();
    }
    value
}

fn normalize_result_row(
    layout: &ResultRowLayout,
    target: &PartitionTarget,
    row: &RowListing,
) -> Result<VehicleRecord, SkipReason> {
    let title = row.cell(0).unwrap_or_default();
    let parts: Vec<&str> = title.splitn(3, char::is_whitespace).collect();
    let [year, make, model] = parts.as_slice() else {
        return Err(SkipReason::Malformed(format!("title {title:?}")));
    };
    let year = coerce_year(Some(*year))?;
    let label = |key: &str| row.label(key).and_then(text_or_none);
    let stock_num = label(layout.stock_label).ok_or(SkipReason::MissingField("stock_num"))?;

    let mut record = VehicleRecord::new(&target.partition_id, stock_num, year, model);
    record.make = Some(make.to_ascii_uppercase());
    record.color = label(layout.color_label);
    record.vin = label(layout.vin_label);
    record.date_listed = label(layout.date_label);
    record.row = label(layout.row_label);
    record.location = target.location.clone();
    for (name, key) in layout.details {
        if let Some(value) = label(*key) {
            record.details.insert(name.to_string(), value);
        }
    }
    record.image = row.image.clone();
    record.image_urls = row.image_urls.clone();
    Ok(record)
}

#[async_trait]
impl SourceAdapter for PagedHtmlAdapter {
    fn source_id(&self) -> &'static str {
        self.profile.source_id
    }

    fn shape(&self) -> SourceShape {
        SourceShape::PagedHtml
    }

    fn model_match(&self) -> ModelMatch {
        self.profile.model_match
    }

    fn default_store_mode(&self) -> StoreMode {
        self.profile.store_mode
    }

    async fn fetch_listing(
        &self,
        ctx: &AdapterContext,
        target: &PartitionTarget,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let mut listings = Vec::new();
        for page in 1..=self.layout.max_pages {
            let mut vars = target.template_vars();
            vars.push(("page".to_string(), page.to_string()));
            let request = self.request.render(&vars)?;
            let response = ctx.fetch_base(&request).await?;
            let parsed = parse_result_page(&response.text(), &self.layout)?;
            debug!(
                source_id = self.profile.source_id,
                partition = %target.partition_id,
                page,
                rows = parsed.rows.len(),
                ended = parsed.ended,
                "fetched result page"
            );
            if parsed.rows.is_empty() && !parsed.ended {
                return Err(AdapterError::shape(
                    &response.final_url,
                    format!("page {page} has no result rows and no end marker"),
                ));
            }
            listings.extend(parsed.rows);
            if parsed.ended {
                info!(
                    source_id = self.profile.source_id,
                    partition = %target.partition_id,
                    pages = page,
                    rows = listings.len(),
                    "fetched paged listing"
                );
                return Ok(listings);
            }
        }
        Err(AdapterError::Message(format!(
            "no end marker after {} pages",
            self.layout.max_pages
        )))
    }

    fn normalize(&self, target: &PartitionTarget, raw: &RawListing) -> Result<VehicleRecord, SkipReason> {
        match raw {
            RawListing::Row(row) => normalize_result_row(&self.layout, target, row),
            RawListing::Json(_) => Err(SkipReason::Malformed("expected a result row".into())),
        }
    }

    async fn enrich(
        &self,
        ctx: &AdapterContext,
        raw: &RawListing,
        record: &VehicleRecord,
    ) -> Result<Option<EnrichmentPatch>, EnrichError> {
        self.profile.enrich(ctx, raw, record).await
    }

    async fn lookup_image(
        &self,
        ctx: &AdapterContext,
        raw: &RawListing,
    ) -> Result<Option<ImageRefs>, EnrichError> {
        self.profile.lookup_image(ctx, raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: HtmlTableLayout = HtmlTableLayout {
        table: "table#cars",
        rows: "tr",
        year: 1,
        make: None,
        model: 2,
        stock_num: StockKey::Column(3),
        color: Some(4),
        vin: None,
        row: None,
        date_listed: None,
        location: None,
        details: &[],
        image: RowImage::FirstCellImg,
        required_make: None,
    };

    #[test]
    fn table_rows_skip_headers_and_capture_first_cell_image() {
        let html = r#"<table id="cars">
            <tr><th>img</th><th>Year</th></tr>
            <tr><td><img src="https://img.test/1.jpg"></td><td> 1984 </td><td>300d</td><td>S1</td><td>Blue</td></tr>
            <tr><td></td><td>1999</td><td>E-Class</td><td>S2</td><td></td></tr>
        </table>"#;
        let rows = parse_table(html, "https://yard.test", &LAYOUT).unwrap();
        assert_eq!(rows.len(), 2);

        let target = PartitionTarget::new("yard");
        let RawListing::Row(first) = &rows[0] else { panic!("row") };
        let record = normalize_table_row(&LAYOUT, &target, first).unwrap();
        assert_eq!(record.year, 1984);
        assert_eq!(record.model, "300D");
        assert_eq!(record.image.as_deref(), Some("https://img.test/1.jpg"));

        let RawListing::Row(second) = &rows[1] else { panic!("row") };
        let record = normalize_table_row(&LAYOUT, &target, second).unwrap();
        assert_eq!(record.color, None);
        assert_eq!(record.image, None);
    }

    #[test]
    fn missing_table_is_a_shape_failure() {
        let err = parse_table("<p>maintenance</p>", "https://yard.test", &LAYOUT).unwrap_err();
        assert!(matches!(err, AdapterError::Shape { .. }));
    }

    #[test]
    fn labelled_values_stop_at_next_label() {
        let html = r#"<div class="row">
            <div class="d"><b>Color:</b> Silver <br> <b>VIN:</b> WDB123</div>
            <div class="d"><b>Available:</b> <time datetime="2024-05-01">May 1</time></div>
        </div>"#;
        let document = Html::parse_fragment(html);
        let bold = selector("b").unwrap();
        let values: Vec<String> = document.select(&bold).map(labelled_value).collect();
        assert_eq!(values[0], "Silver");
        assert_eq!(values[1], "WDB123");
    }
}
