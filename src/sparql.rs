use crate::domain::EntityId;
use crate::geometry::BoundingBox;

pub const ID_COLUMN: &str = "wikidata_id";
pub const INSTANCE_OF_ID_COLUMN: &str = "instance_of_id";
pub const INSTANCE_OF_COLUMN: &str = "instance_of";
pub const GEOM_COLUMN: &str = "geom";

/// All items that are instances of `class` or of any of its subclasses.
pub fn instance_of_query(class: &EntityId) -> String {
    format!(
        "SELECT ?{ID_COLUMN} WHERE {{\n  ?{ID_COLUMN} wdt:P31/wdt:P279* wd:{class}.\n}}"
    )
}

/// Items with a coordinate location inside `bbox`, one row per `instance of` statement.
pub fn bbox_query(bbox: &BoundingBox) -> String {
    format!(
        "SELECT ?{ID_COLUMN} ?{INSTANCE_OF_ID_COLUMN} ?{GEOM_COLUMN}\n\
         WHERE {{\n  \
           ?{ID_COLUMN} wdt:P31 ?{INSTANCE_OF_ID_COLUMN}.\n  \
           SERVICE wikibase:box {{\n    \
             ?{ID_COLUMN} wdt:P625 ?{GEOM_COLUMN} .\n    \
             bd:serviceParam wikibase:cornerWest \"Point({} {})\"^^geo:wktLiteral.\n    \
             bd:serviceParam wikibase:cornerEast \"Point({} {})\"^^geo:wktLiteral.\n  \
           }}\n\
         }}",
        bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat
    )
}
