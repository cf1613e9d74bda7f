//! Ad detail page to JSON record.
//!
//! Output keys match the downstream consumers of `json/{ad_id}.json`, which
//! expect the site's Croatian field names.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    pub approximate: bool,
}

/// Structured view of one ad.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailRecord {
    pub id: String,
    #[serde(rename = "link", skip_serializing_if = "Option::is_none")]
    pub canonical: Option<String>,
    #[serde(rename = "lokacija", skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(rename = "naslov")]
    pub title: Option<String>,
    #[serde(rename = "cijena")]
    pub price: Option<String>,
    #[serde(rename = "opis")]
    pub description: Option<String>,
    #[serde(rename = "naziv_agencije", skip_serializing_if = "Option::is_none")]
    pub agency_name: Option<String>,
    #[serde(rename = "profil_agencije", skip_serializing_if = "Option::is_none")]
    pub agency_profile: Option<String>,
    #[serde(rename = "email_agencije", skip_serializing_if = "Option::is_none")]
    pub agency_email: Option<String>,
    #[serde(rename = "adresa_agencije", skip_serializing_if = "Option::is_none")]
    pub agency_address: Option<String>,
    #[serde(rename = "telefon")]
    pub phone: Option<String>,
    #[serde(rename = "oglas_objavljen", skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(rename = "do_isteka", skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<String>,
    #[serde(rename = "oglas_prikazan", skip_serializing_if = "Option::is_none")]
    pub views: Option<String>,
    #[serde(rename = "slike")]
    pub images: Vec<String>,
    /// Basic-detail key/values and property groups, keyed by their labels.
    #[serde(flatten)]
    pub details: BTreeMap<String, serde_json::Value>,
}

/// Pure HTML to record extraction. Never fails; missing parts stay empty.
pub trait DetailParser: Send + Sync {
    fn extract(&self, raw_html: &str, ad_id: &str) -> DetailRecord;
}

static LAT_LNG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""lat":([\d.\-]+),"lng":([\d.\-]+),"approximate":(true|false)"#).unwrap()
});

fn selector(css: &str) -> Selector {
    Selector::parse(css).unwrap()
}

static CANONICAL: LazyLock<Selector> = LazyLock::new(|| selector("link[rel=\"canonical\"]"));
static SCRIPT: LazyLock<Selector> = LazyLock::new(|| selector("script"));
static TITLE: LazyLock<Selector> = LazyLock::new(|| selector("title"));
static PRICE: LazyLock<Selector> = LazyLock::new(|| {
    selector("dl.ClassifiedDetailSummary-priceRow dd.ClassifiedDetailSummary-priceDomestic")
});
static BASIC_LIST: LazyLock<Selector> = LazyLock::new(|| {
    selector("div.ClassifiedDetailBasicDetails dl.ClassifiedDetailBasicDetails-list")
});
static DT: LazyLock<Selector> = LazyLock::new(|| selector("dt"));
static DD: LazyLock<Selector> = LazyLock::new(|| selector("dd"));
static TEXT_WRAP: LazyLock<Selector> =
    LazyLock::new(|| selector("span.ClassifiedDetailBasicDetails-textWrapContainer"));
static DESCRIPTION: LazyLock<Selector> =
    LazyLock::new(|| selector("div.ClassifiedDetailDescription-text"));
static GROUP: LazyLock<Selector> =
    LazyLock::new(|| selector("section.ClassifiedDetailPropertyGroups-group"));
static GROUP_TITLE: LazyLock<Selector> =
    LazyLock::new(|| selector("h3.ClassifiedDetailPropertyGroups-groupTitle"));
static GROUP_ITEM: LazyLock<Selector> =
    LazyLock::new(|| selector("li.ClassifiedDetailPropertyGroups-groupListItem"));
static OWNER: LazyLock<Selector> = LazyLock::new(|| selector("div.ClassifiedDetailOwnerDetails"));
static OWNER_TITLE: LazyLock<Selector> =
    LazyLock::new(|| selector("h2.ClassifiedDetailOwnerDetails-title a"));
static OWNER_WEB: LazyLock<Selector> = LazyLock::new(|| selector("a[href^='http']"));
static OWNER_MAIL: LazyLock<Selector> = LazyLock::new(|| selector("a[href^='mailto']"));
static OWNER_ADDRESS: LazyLock<Selector> = LazyLock::new(|| {
    selector("li.ClassifiedDetailOwnerDetails-contactEntry i[aria-label='Adresa']")
});
static SYSTEM_LIST: LazyLock<Selector> =
    LazyLock::new(|| selector("dl.ClassifiedDetailSystemDetails-list"));
static IMAGE: LazyLock<Selector> = LazyLock::new(|| selector("li[data-media-type='image']"));

/// Parser for the site's classified detail markup.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlDetailParser;

fn text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

impl DetailParser for HtmlDetailParser {
    fn extract(&self, raw_html: &str, ad_id: &str) -> DetailRecord {
        let doc = Html::parse_document(raw_html);
        let mut record = DetailRecord {
            id: ad_id.to_string(),
            ..DetailRecord::default()
        };

        record.canonical = doc
            .select(&CANONICAL)
            .next()
            .and_then(|l| l.value().attr("href"))
            .map(str::to_string);

        record.location = doc.select(&SCRIPT).find_map(|script| {
            let body = script.text().collect::<String>();
            let caps = LAT_LNG.captures(&body)?;
            Some(Location {
                lat: caps[1].parse().ok()?,
                lng: caps[2].parse().ok()?,
                approximate: &caps[3] == "true",
            })
        });

        record.title = doc.select(&TITLE).next().map(text);
        record.price = doc.select(&PRICE).next().map(text).and_then(non_empty);
        record.description = doc.select(&DESCRIPTION).next().map(text);

        if let Some(list) = doc.select(&BASIC_LIST).next() {
            for (dt, dd) in list.select(&DT).zip(list.select(&DD)) {
                let key = dt.select(&TEXT_WRAP).next().map(text).unwrap_or_default();
                let value = dd.select(&TEXT_WRAP).next().map(text).unwrap_or_default();
                if !key.is_empty() && !value.is_empty() {
                    record.details.insert(key, serde_json::Value::String(value));
                }
            }
        }

        for group in doc.select(&GROUP) {
            let Some(title) = group.select(&GROUP_TITLE).next().map(text) else {
                continue;
            };
            let items: Vec<serde_json::Value> = group
                .select(&GROUP_ITEM)
                .map(text)
                .filter(|s| !s.is_empty())
                .map(serde_json::Value::String)
                .collect();
            if !title.is_empty() && !items.is_empty() {
                record.details.insert(title, serde_json::Value::Array(items));
            }
        }

        if let Some(owner) = doc.select(&OWNER).next() {
            record.agency_name = owner.select(&OWNER_TITLE).next().map(text);
            record.agency_profile = owner
                .select(&OWNER_WEB)
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(str::to_string);
            record.agency_email = owner.select(&OWNER_MAIL).next().map(text);
            record.agency_address = owner
                .select(&OWNER_ADDRESS)
                .next()
                .and_then(|icon| icon.parent())
                .and_then(ElementRef::wrap)
                .map(|li| text(li).replace("Adresa: ", "").trim().to_string());
        }

        if let Some(list) = doc.select(&SYSTEM_LIST).next() {
            for (dt, dd) in list.select(&DT).zip(list.select(&DD)) {
                let value = non_empty(text(dd));
                match text(dt).as_str() {
                    "Oglas objavljen" => record.published = value,
                    "Do isteka još" => record.expires_in = value,
                    "Oglas prikazan" => record.views = value,
                    _ => {}
                }
            }
        }

        record.images = doc
            .select(&IMAGE)
            .filter_map(|li| li.value().attr("data-large-image-url"))
            .map(str::to_string)
            .collect();

        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head>
      <title> Stan: Zagreb, Trnje, 54 m2 </title>
      <link rel="canonical" href="https://www.njuskalo.hr/nekretnine/stan-trnje-oglas-45123">
      <script>var x = {"lat":45.80,"lng":15.97,"approximate":true};</script>
    </head><body>
      <dl class="ClassifiedDetailSummary-priceRow">
        <dd class="ClassifiedDetailSummary-priceDomestic">185.000 €</dd>
      </dl>
      <div class="ClassifiedDetailBasicDetails"><dl class="ClassifiedDetailBasicDetails-list">
        <dt><span class="ClassifiedDetailBasicDetails-textWrapContainer">Lokacija</span></dt>
        <dd><span class="ClassifiedDetailBasicDetails-textWrapContainer">Grad Zagreb, Trnje</span></dd>
        <dt><span class="ClassifiedDetailBasicDetails-textWrapContainer">Broj soba</span></dt>
        <dd><span class="ClassifiedDetailBasicDetails-textWrapContainer">2-sobni</span></dd>
      </dl></div>
      <div class="ClassifiedDetailDescription-text">Lijep stan
        blizu centra.</div>
      <section class="ClassifiedDetailPropertyGroups-group">
        <h3 class="ClassifiedDetailPropertyGroups-groupTitle">Grijanje</h3>
        <ul><li class="ClassifiedDetailPropertyGroups-groupListItem">Plin</li>
            <li class="ClassifiedDetailPropertyGroups-groupListItem"> </li></ul>
      </section>
      <div class="ClassifiedDetailOwnerDetails">
        <h2 class="ClassifiedDetailOwnerDetails-title"><a href="/agencija">Agencija Dom</a></h2>
        <a href="https://agencija-dom.hr">web</a>
        <a href="mailto:info@agencija-dom.hr">info@agencija-dom.hr</a>
        <ul><li class="ClassifiedDetailOwnerDetails-contactEntry"><i aria-label="Adresa"></i>Adresa: Ilica 1, Zagreb</li></ul>
      </div>
      <dl class="ClassifiedDetailSystemDetails-list">
        <dt>Oglas objavljen</dt><dd>12.05.2024. u 10:15</dd>
        <dt>Do isteka još</dt><dd>30 dana</dd>
        <dt>Oglas prikazan</dt><dd>412 puta</dd>
      </dl>
      <ul><li data-media-type="image" data-large-image-url="https://img/1.jpg"></li>
          <li data-media-type="image"></li>
          <li data-media-type="image" data-large-image-url="https://img/2.jpg"></li></ul>
    </body></html>"#;

    #[test]
    fn test_extracts_detail_fields() {
        let record = HtmlDetailParser.extract(PAGE, "45123");
        assert_eq!(record.id, "45123");
        assert_eq!(
            record.canonical.as_deref(),
            Some("https://www.njuskalo.hr/nekretnine/stan-trnje-oglas-45123")
        );
        assert_eq!(
            record.location,
            Some(Location {
                lat: 45.80,
                lng: 15.97,
                approximate: true
            })
        );
        assert_eq!(record.title.as_deref(), Some("Stan: Zagreb, Trnje, 54 m2"));
        assert_eq!(record.price.as_deref(), Some("185.000 €"));
        assert_eq!(record.description.as_deref(), Some("Lijep stan blizu centra."));
        assert_eq!(
            record.details.get("Broj soba"),
            Some(&serde_json::json!("2-sobni"))
        );
        assert_eq!(record.details.get("Grijanje"), Some(&serde_json::json!(["Plin"])));
        assert_eq!(record.agency_name.as_deref(), Some("Agencija Dom"));
        assert_eq!(record.agency_profile.as_deref(), Some("https://agencija-dom.hr"));
        assert_eq!(record.agency_email.as_deref(), Some("info@agencija-dom.hr"));
        assert_eq!(record.agency_address.as_deref(), Some("Ilica 1, Zagreb"));
        assert_eq!(record.published.as_deref(), Some("12.05.2024. u 10:15"));
        assert_eq!(record.expires_in.as_deref(), Some("30 dana"));
        assert_eq!(record.views.as_deref(), Some("412 puta"));
        assert_eq!(record.images, vec!["https://img/1.jpg", "https://img/2.jpg"]);
    }

    #[test]
    fn test_output_keys() {
        let mut record = HtmlDetailParser.extract(PAGE, "45123");
        record.phone = Some("091 234 5678".into());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["naslov"], "Stan: Zagreb, Trnje, 54 m2");
        assert_eq!(json["telefon"], "091 234 5678");
        assert_eq!(json["lokacija"]["approximate"], true);
        assert_eq!(json["Lokacija"], "Grad Zagreb, Trnje");
    }

    #[test]
    fn test_garbage_gives_empty_record() {
        let record = HtmlDetailParser.extract("not html at all", "1");
        assert_eq!(record.id, "1");
        assert!(record.title.is_none());
        assert!(record.images.is_empty());
        assert!(record.details.is_empty());
    }
}
