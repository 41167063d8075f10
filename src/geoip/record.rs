//! Typed rows of the GeoLite2 Country CSV files.
//!
//! Every file kind has a fixed column order. Rows are mapped by position, so
//! a reordered feed fails loudly instead of silently shuffling fields.

use crate::geoip::error::{ParseError, RecordError};

use csv::StringRecord;
use ipnet::{AddrParseError, Ipv4Net, Ipv6Net};
use std::io::Read;
use std::str::FromStr;

pub type GeonameId = i64;

/// CIDR network of a single address family
pub trait Network: FromStr<Err = AddrParseError> + Copy + Eq + std::fmt::Debug {
    /// Network with host bits cleared
    fn normalized(self) -> Self;
}

impl Network for Ipv4Net {
    fn normalized(self) -> Self {
        self.trunc()
    }
}

impl Network for Ipv6Net {
    fn normalized(self) -> Self {
        self.trunc()
    }
}

pub trait CsvRecord: Sized {
    /// Name of the first column in the feed's header row
    const HEADER: &'static str;

    fn from_row(row: &StringRecord) -> Result<Self, RecordError>;
}

/// `GeoLite2-Country-Blocks-IPv{4,6}.csv` row
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRecord<N> {
    pub network: Option<N>,
    pub geoname_id: Option<GeonameId>,
    pub registered_country_geoname_id: Option<GeonameId>,
    pub represented_country_geoname_id: Option<GeonameId>,
    pub is_anonymous_proxy: bool,
    pub is_satellite_provider: bool,
}

pub type Ipv4BlockRecord = BlockRecord<Ipv4Net>;
pub type Ipv6BlockRecord = BlockRecord<Ipv6Net>;

impl<N> CsvRecord for BlockRecord<N>
where
    N: Network,
{
    const HEADER: &'static str = "network";

    fn from_row(row: &StringRecord) -> Result<Self, RecordError> {
        Ok(Self {
            network: parse_network(field(row, 0, "network")?, "network")?,
            geoname_id: parse_id(field(row, 1, "geoname_id")?, "geoname_id")?,
            registered_country_geoname_id: parse_id(
                field(row, 2, "registered_country_geoname_id")?,
                "registered_country_geoname_id",
            )?,
            represented_country_geoname_id: parse_id(
                field(row, 3, "represented_country_geoname_id")?,
                "represented_country_geoname_id",
            )?,
            is_anonymous_proxy: parse_bool(
                field(row, 4, "is_anonymous_proxy")?,
                "is_anonymous_proxy",
            )?,
            is_satellite_provider: parse_bool(
                field(row, 5, "is_satellite_provider")?,
                "is_satellite_provider",
            )?,
        })
    }
}

/// `GeoLite2-Country-Locations-<locale>.csv` row
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CountryLocationRecord {
    pub geoname_id: GeonameId,
    pub locale_code: String,
    pub continent_code: String,
    pub continent_name: String,
    pub country_iso_code: String,
    pub country_name: String,
    pub is_in_european_union: bool,
}

impl CsvRecord for CountryLocationRecord {
    const HEADER: &'static str = "geoname_id";

    fn from_row(row: &StringRecord) -> Result<Self, RecordError> {
        let geoname_id = field(row, 0, "geoname_id")?;
        Ok(Self {
            geoname_id: geoname_id
                .parse()
                .map_err(|error| RecordError::Integer {
                    field: "geoname_id",
                    value: geoname_id.to_owned(),
                    error,
                })?,
            locale_code: field(row, 1, "locale_code")?.to_owned(),
            continent_code: field(row, 2, "continent_code")?.to_owned(),
            continent_name: field(row, 3, "continent_name")?.to_owned(),
            country_iso_code: field(row, 4, "country_iso_code")?.to_owned(),
            country_name: field(row, 5, "country_name")?.to_owned(),
            is_in_european_union: parse_bool(
                field(row, 6, "is_in_european_union")?,
                "is_in_european_union",
            )?,
        })
    }
}

fn field<'a>(
    row: &'a StringRecord,
    index: usize,
    name: &'static str,
) -> Result<&'a str, RecordError> {
    row.get(index).ok_or(RecordError::MissingField { index, field: name })
}

fn parse_network<N: Network>(s: &str, field: &'static str) -> Result<Option<N>, RecordError> {
    if s.is_empty() {
        return Ok(None);
    }
    let network: N = s.parse().map_err(|error| RecordError::Network {
        field,
        value: s.to_owned(),
        error,
    })?;
    Ok(Some(network.normalized()))
}

fn parse_id(s: &str, field: &'static str) -> Result<Option<GeonameId>, RecordError> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse().map(Some).map_err(|error| RecordError::Integer {
        field,
        value: s.to_owned(),
        error,
    })
}

fn parse_bool(s: &str, field: &'static str) -> Result<bool, RecordError> {
    match s {
        "1" | "t" | "T" | "true" | "True" | "TRUE" => Ok(true),
        "0" | "f" | "F" | "false" | "False" | "FALSE" => Ok(false),
        _ => Err(RecordError::Boolean {
            field,
            value: s.to_owned(),
        }),
    }
}

/// Parse a whole CSV stream, failing on the first malformed row.
///
/// An empty stream, or one holding only the header row, is an empty success.
pub fn parse_records<R, T>(reader: R) -> Result<Vec<T>, ParseError>
where
    R: Read,
    T: CsvRecord,
{
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut records = vec![];
    for (i, row) in csv_reader.records().enumerate() {
        let row = row?;
        if i == 0 && row.get(0) == Some(T::HEADER) {
            continue;
        }
        let record = T::from_row(&row).map_err(|error| ParseError::InvalidRecord {
            line: row.position().map_or(i as u64 + 1, |position| position.line()),
            record: row.iter().collect::<Vec<_>>().join(","),
            error,
        })?;
        records.push(record);
    }
    Ok(records)
}
