//! Query descriptions and the store queries derived from them.

use serde_json::{Number, Value};

use crate::application::store::{StoreQuery, WatchPipeline};
use crate::cache::Fingerprint;
use crate::domain::document::{DocId, Document, ID_FIELD};
use crate::domain::filter::{FULL_DOCUMENT_PREFIX, to_change_feed_match};
use crate::domain::sort::SortSpec;

/// Per-request paging options. They are not part of the cache key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}

impl FetchOptions {
    pub fn skips(&self) -> bool {
        self.skip.is_some_and(|skip| skip > 0)
    }
}

/// Description of a cursor: what to read and how to shape it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchDescription {
    pub collection: String,
    pub filter: Document,
    pub sort: Option<SortSpec>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub projection: Option<Document>,
    /// Paginated reads always go to the store and track a per-subscriber
    /// position for refills.
    pub paginate: bool,
}

impl FetchDescription {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Self::default()
        }
    }

    pub fn with_filter(mut self, filter: Document) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_projection(mut self, projection: Document) -> Self {
        self.projection = Some(projection);
        self
    }

    pub fn paginated(mut self) -> Self {
        self.paginate = true;
        self
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(&self.collection, &self.filter, self.sort.as_ref())
    }

    pub fn options(&self) -> FetchOptions {
        FetchOptions {
            skip: self.skip,
            limit: self.window_limit(),
        }
    }

    /// A zero limit means no limit, as it does for the store.
    fn window_limit(&self) -> Option<u64> {
        self.limit.filter(|limit| *limit > 0)
    }

    /// Store query for this description. The sort field is always fetched so
    /// cached windows can be re-sorted and used as refill positions.
    pub fn to_store_query(&self) -> StoreQuery {
        StoreQuery {
            collection: self.collection.clone(),
            filter: self.filter.clone(),
            sort: self.sort.clone(),
            skip: self.skip,
            limit: self.window_limit(),
            projection: self
                .projection
                .as_ref()
                .map(|projection| retain_sort_field(projection, self.sort.as_ref())),
        }
    }
}

fn is_inclusion(projection: &Document) -> bool {
    projection
        .iter()
        .filter(|(field, _)| field.as_str() != ID_FIELD)
        .all(|(_, flag)| match flag {
            Value::Bool(flag) => *flag,
            Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
            _ => true,
        })
}

fn retain_sort_field(projection: &Document, sort: Option<&SortSpec>) -> Document {
    let mut projection = projection.clone();
    let Some(sort) = sort else {
        return projection;
    };
    if projection.is_empty() {
        return projection;
    }
    if is_inclusion(&projection) {
        projection
            .entry(sort.field.clone())
            .or_insert(Value::Number(Number::from(1)));
    } else {
        projection.remove(&sort.field);
    }
    projection
}

/// Add a condition on `field`, combining with an existing one through `$and`.
fn and_condition(filter: &Document, field: &str, condition: Value) -> Document {
    let mut combined = filter.clone();
    if !combined.contains_key(field) {
        combined.insert(field.to_string(), condition);
        return combined;
    }

    let mut extra = Document::new();
    extra.insert(field.to_string(), condition);
    match combined.get_mut("$and") {
        Some(Value::Array(clauses)) => clauses.push(Value::Object(extra)),
        _ => {
            combined.insert("$and".to_string(), Value::Array(vec![Value::Object(extra)]));
        }
    }
    combined
}

/// Documents that sort strictly after `position` on the sort field.
pub fn positional_query(
    collection: &str,
    filter: &Document,
    sort: &SortSpec,
    position: Value,
    limit: u64,
) -> StoreQuery {
    let mut bound = Document::new();
    bound.insert(sort.after_operator().to_string(), position);
    StoreQuery {
        collection: collection.to_string(),
        filter: and_condition(filter, &sort.field, Value::Object(bound)),
        sort: Some(sort.clone()),
        skip: None,
        limit: Some(limit),
        projection: None,
    }
}

/// Documents matching `filter` except those in `exclude`.
pub fn exclusion_query<'a>(
    collection: &str,
    filter: &Document,
    sort: Option<&SortSpec>,
    exclude: impl IntoIterator<Item = &'a DocId>,
    limit: u64,
) -> StoreQuery {
    let ids = exclude.into_iter().map(DocId::to_value).collect();
    let mut nin = Document::new();
    nin.insert("$nin".to_string(), Value::Array(ids));
    StoreQuery {
        collection: collection.to_string(),
        filter: and_condition(filter, ID_FIELD, Value::Object(nin)),
        sort: sort.cloned(),
        skip: None,
        limit: Some(limit),
        projection: None,
    }
}

fn document_of(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Document {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Pipeline for a change feed over documents matching `filter`.
///
/// Updates and deletes always pass: their events may not carry the document,
/// so they are matched against subscribers after the fact. Administrative
/// events pass too so subscribers learn their collection went away.
pub fn change_feed_pipeline(filter: &Document, projection: Option<&Document>) -> WatchPipeline {
    let match_expression = if filter.is_empty() {
        Document::new()
    } else {
        document_of([(
            "$or",
            Value::Array(vec![
                Value::Object(to_change_feed_match(filter)),
                Value::Object(document_of([(
                    "updateDescription",
                    Value::Object(document_of([("$exists", Value::Bool(true))])),
                )])),
                Value::Object(document_of([(
                    "operationType",
                    Value::Object(document_of([(
                        "$nin",
                        Value::Array(
                            ["insert", "replace", "update"]
                                .into_iter()
                                .map(|op| Value::String(op.to_string()))
                                .collect(),
                        ),
                    )])),
                )])),
            ]),
        )])
    };

    let projection = projection.filter(|projection| !projection.is_empty()).map(|projection| {
        projection
            .iter()
            .map(|(field, flag)| (format!("{FULL_DOCUMENT_PREFIX}{field}"), flag.clone()))
            .collect::<Document>()
    });

    WatchPipeline {
        match_expression,
        projection,
    }
}
