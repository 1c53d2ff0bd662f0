//! Dolphin download page parser
//!
//! Pulls the newest development build link and the dev changelog out of
//! the markup served by `https://dolphin-emu.org/download/`.

use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::CatalogError;

/// What the HTML capability extracts from a download page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPage {
    pub download_url: String,
    pub changelog: String,
}

/// Turns raw page markup into a download URL and changelog
pub trait PageParser: Send + Sync {
    fn parse(&self, html: &str, page_url: &str) -> Result<ParsedPage, CatalogError>;
}

/// Parser for the dolphin-emu.org download page
#[derive(Debug, Default, Clone, Copy)]
pub struct DolphinPage;

const DOWNLOAD_LINK: &str = "a.btn.always-ltr.btn-info.win[href]";
const DEV_VERSIONS_TABLE: &str = "table.versions-list.dev-versions";
const INFO_ROW: &str = "tr.infos";
const VERSION_CELL: &str = "td.version a";
const DATE_CELL: &str = "td.reldate";
const DESCRIPTION_CELL: &str = "td.description";

fn selector(css: &'static str) -> Result<Selector, CatalogError> {
    Selector::parse(css).map_err(|e| CatalogError::Parse(format!("bad selector {}: {}", css, e)))
}

fn cell_text(row: &ElementRef<'_>, sel: &Selector) -> Option<String> {
    row.select(sel)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
}

impl DolphinPage {
    fn download_url(&self, document: &Html, page_url: &str) -> Result<String, CatalogError> {
        let link = selector(DOWNLOAD_LINK)?;
        let href = document
            .select(&link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                CatalogError::Parse("no Windows download button on the page".to_string())
            })?;

        // Links on the page are absolute today, but resolve relative ones too
        match Url::parse(href) {
            Ok(url) => Ok(url.to_string()),
            Err(_) => {
                let base = Url::parse(page_url)
                    .map_err(|e| CatalogError::Parse(format!("invalid page URL {}: {}", page_url, e)))?;
                base.join(href)
                    .map(|u| u.to_string())
                    .map_err(|e| CatalogError::Parse(format!("invalid download link {}: {}", href, e)))
            }
        }
    }

    fn changelog(&self, document: &Html) -> Result<String, CatalogError> {
        let table_sel = selector(DEV_VERSIONS_TABLE)?;
        let row_sel = selector(INFO_ROW)?;
        let version_sel = selector(VERSION_CELL)?;
        let date_sel = selector(DATE_CELL)?;
        let description_sel = selector(DESCRIPTION_CELL)?;

        let table = document.select(&table_sel).next().ok_or_else(|| {
            CatalogError::Parse("no development versions table on the page".to_string())
        })?;

        let mut text = String::new();
        for row in table.select(&row_sel) {
            let Some(version) = cell_text(&row, &version_sel) else {
                debug!("Skipping changelog row without a version link");
                continue;
            };
            let change = cell_text(&row, &description_sel).unwrap_or_default();

            text.push_str(&version);
            if let Some(date) = cell_text(&row, &date_sel).filter(|d| !d.is_empty()) {
                text.push_str(" - ");
                text.push_str(&date);
            }
            text.push_str(":\n");
            text.push_str(&change);
            text.push_str("\n\n");
        }

        Ok(text)
    }
}

impl PageParser for DolphinPage {
    fn parse(&self, html: &str, page_url: &str) -> Result<ParsedPage, CatalogError> {
        let document = Html::parse_document(html);

        Ok(ParsedPage {
            download_url: self.download_url(&document, page_url)?,
            changelog: self.changelog(&document)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_URL: &str = "https://dolphin-emu.org/download/";

    fn sample_page() -> String {
        r#"<html><body>
        <a class="btn always-ltr btn-info win" href="https://dl.dolphin-emu.org/builds/dolphin-master-5.0-12345-x64.7z">Windows x64</a>
        <a class="btn always-ltr btn-info mac" href="https://dl.dolphin-emu.org/builds/dolphin-master-5.0-12345.dmg">macOS</a>
        <table class="versions-list dev-versions">
          <tr class="infos">
            <td class="version"><a href="/download/dev/abc/">5.0-12345</a></td>
            <td class="reldate">2 hours ago</td>
            <td class="description">Fix the thing</td>
          </tr>
          <tr class="download"><td>ignored</td></tr>
          <tr class="infos">
            <td class="version"><a href="/download/dev/def/">5.0-12340</a></td>
            <td class="reldate">1 day ago</td>
            <td class="description"> Break the other thing </td>
          </tr>
        </table>
        </body></html>"#
            .to_string()
    }

    #[test]
    fn test_parse_download_link() {
        let parsed = DolphinPage.parse(&sample_page(), PAGE_URL).unwrap();
        assert_eq!(
            parsed.download_url,
            "https://dl.dolphin-emu.org/builds/dolphin-master-5.0-12345-x64.7z"
        );
    }

    #[test]
    fn test_parse_changelog() {
        let parsed = DolphinPage.parse(&sample_page(), PAGE_URL).unwrap();
        assert_eq!(
            parsed.changelog,
            "5.0-12345 - 2 hours ago:\nFix the thing\n\n5.0-12340 - 1 day ago:\nBreak the other thing\n\n"
        );
    }

    #[test]
    fn test_relative_link_is_resolved() {
        let html = r#"<a class="btn always-ltr btn-info win" href="/builds/d.7z">x</a>
            <table class="versions-list dev-versions"></table>"#;
        let parsed = DolphinPage.parse(html, PAGE_URL).unwrap();
        assert_eq!(parsed.download_url, "https://dolphin-emu.org/builds/d.7z");
        assert!(parsed.changelog.is_empty());
    }

    #[test]
    fn test_missing_link_is_parse_error() {
        let html = r#"<table class="versions-list dev-versions"></table>"#;
        let err = DolphinPage.parse(html, PAGE_URL).unwrap_err();
        assert!(matches!(err, CatalogError::Parse(_)));
        assert!(err.to_string().contains("download button"));
    }

    #[test]
    fn test_missing_changelog_is_parse_error() {
        let html = r#"<a class="btn always-ltr btn-info win" href="https://x/d.7z">x</a>"#;
        let err = DolphinPage.parse(html, PAGE_URL).unwrap_err();
        assert!(matches!(err, CatalogError::Parse(_)));
        assert!(err.to_string().contains("versions table"));
    }
}
