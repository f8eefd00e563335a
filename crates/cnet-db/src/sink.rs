//! Bulk result writes through `COPY`.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, instrument};

use cnet_core::{Error, Geometry, MeasureRecord, PointRecord, Result, ResultSink, RunConfig};

use crate::csv::CsvBuffer;

const POINT_COLUMNS: &str = "id, \"pointType\", identifier, overlapid, cam_type, \
     \"pointIgnore\", apriori, adjusted, \"referenceIndex\"";

const MEASURE_INSERT_COLUMNS: &str = "pointid, imageid, serialnumber, \"measureType\", sample, \
     line, apriorisample, aprioriline, \"measureIgnore\", \"ChooserName\", \"templateMetric\", \
     \"templateShift\", weight";

const MEASURE_UPDATE_COLUMNS: &str = "id, pointid, imageid, serialnumber, \"measureType\", \
     sample, line, apriorisample, aprioriline, \"measureIgnore\", \"ChooserName\", \
     \"templateMetric\", \"templateShift\", weight";

const CREATE_UPDATE_STAGING: &str = "CREATE TEMP TABLE measure_updates (\
     id bigint PRIMARY KEY, pointid bigint, imageid bigint, serialnumber text, \
     \"measureType\" integer, sample double precision, line double precision, \
     apriorisample double precision, aprioriline double precision, \"measureIgnore\" boolean, \
     \"ChooserName\" text, \"templateMetric\" double precision, \
     \"templateShift\" double precision, weight double precision) ON COMMIT DROP";

const APPLY_UPDATES: &str = "UPDATE measures AS m SET \
     pointid = COALESCE(u.pointid, m.pointid), \
     imageid = u.imageid, \
     serialnumber = u.serialnumber, \
     \"measureType\" = u.\"measureType\", \
     sample = u.sample, \
     line = u.line, \
     apriorisample = u.apriorisample, \
     aprioriline = u.aprioriline, \
     \"measureIgnore\" = u.\"measureIgnore\", \
     \"ChooserName\" = u.\"ChooserName\", \
     \"templateMetric\" = u.\"templateMetric\", \
     \"templateShift\" = u.\"templateShift\", \
     weight = u.weight \
     FROM measure_updates AS u WHERE m.id = u.id";

/// SRID of body-fixed coordinates, read from `spatial.rectangular_srid`.
pub fn rectangular_srid(config: &RunConfig) -> Option<i32> {
    config
        .extra
        .get("spatial")
        .and_then(|s| s.get("rectangular_srid"))
        .and_then(|v| v.as_i64())
        .and_then(|v| i32::try_from(v).ok())
}

/// [`ResultSink`] writing to the `points` and `measures` tables.
#[derive(Clone)]
pub struct PgResultSink {
    pool: PgPool,
    srid: Option<i32>,
}

impl PgResultSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, srid: None }
    }

    pub fn with_srid(mut self, srid: Option<i32>) -> Self {
        self.srid = srid;
        self
    }

    fn coordinate(&self, xyz: Option<[f64; 3]>) -> Option<String> {
        xyz.map(|[x, y, z]| {
            let geom = Geometry::PointZ { x, y, z };
            match self.srid {
                Some(srid) => geom.to_ewkt(srid),
                None => geom.to_wkt(),
            }
        })
    }
}

/// Encode points with pre-allocated ids, and their measures pointing at those ids.
pub(crate) fn encode_points(
    points: &[PointRecord],
    ids: &[i64],
    coordinate: impl Fn(Option<[f64; 3]>) -> Option<String>,
) -> Result<(CsvBuffer, CsvBuffer)> {
    if ids.len() != points.len() {
        return Err(Error::Internal(format!(
            "allocated {} point ids for {} points",
            ids.len(),
            points.len()
        )));
    }
    let mut point_csv = CsvBuffer::new();
    let mut measure_csv = CsvBuffer::new();

    for (point, &id) in points.iter().zip(ids) {
        point_csv
            .int(id)
            .int(point.pointtype as i64)
            .opt_text(point.identifier.as_deref())
            .opt_int(point.overlapid)
            .opt_text(point.cam_type.as_deref())
            .boolean(point.ignore)
            .opt_text(coordinate(point.apriori).as_deref())
            .opt_text(coordinate(point.adjusted).as_deref())
            .int(point.reference_index as i64);
        point_csv.end_row();

        for measure in &point.measures {
            measure_csv.int(id);
            encode_measure_fields(&mut measure_csv, measure);
            measure_csv.end_row();
        }
    }
    Ok((point_csv, measure_csv))
}

fn encode_measure_fields(csv: &mut CsvBuffer, m: &MeasureRecord) {
    csv.int(m.imageid)
        .text(&m.serial)
        .int(m.measuretype as i64)
        .float(m.sample)
        .float(m.line)
        .opt_float(m.apriorisample)
        .opt_float(m.aprioriline)
        .boolean(m.ignore)
        .opt_text(m.choosername.as_deref())
        .opt_float(m.template_metric)
        .opt_float(m.template_shift)
        .opt_float(m.weight);
}

/// Encode measure updates; every record must carry its id.
/// Encode measure updates for the staging table.
///
/// The staging table is keyed on id, so when a batch carries several updates
/// for one measure only the last is kept.
pub(crate) fn encode_measure_updates(measures: &[MeasureRecord]) -> Result<CsvBuffer> {
    let mut last = HashMap::with_capacity(measures.len());
    for (index, m) in measures.iter().enumerate() {
        m.validate_update()?;
        if let Some(id) = m.id {
            last.insert(id, index);
        }
    }

    let mut csv = CsvBuffer::new();
    for (index, m) in measures.iter().enumerate() {
        let Some(id) = m.id else { continue };
        if last.get(&id) != Some(&index) {
            continue;
        }
        csv.int(id).opt_int(m.pointid);
        encode_measure_fields(&mut csv, m);
        csv.end_row();
    }
    if csv.rows() < measures.len() {
        debug!(
            superseded = measures.len() - csv.rows(),
            "Collapsed repeated measure updates"
        );
    }
    Ok(csv)
}

#[async_trait]
impl ResultSink for PgResultSink {
    #[instrument(skip(self, points), fields(subsystem = "database", db_table = "points", batch_size = points.len()))]
    async fn insert_points(&self, points: &[PointRecord]) -> Result<u64> {
        if points.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT nextval(pg_get_serial_sequence('points', 'id'))::bigint \
             FROM generate_series(1, $1)",
        )
        .bind(points.len() as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let (point_csv, measure_csv) = encode_points(points, &ids, |xyz| self.coordinate(xyz))?;

        let mut copy = tx
            .copy_in_raw(&format!(
                "COPY points ({}) FROM STDIN WITH (FORMAT csv)",
                POINT_COLUMNS
            ))
            .await
            .map_err(Error::Database)?;
        copy.send(point_csv.as_bytes()).await.map_err(Error::Database)?;
        let written = copy.finish().await.map_err(Error::Database)?;

        if measure_csv.rows() > 0 {
            let mut copy = tx
                .copy_in_raw(&format!(
                    "COPY measures ({}) FROM STDIN WITH (FORMAT csv)",
                    MEASURE_INSERT_COLUMNS
                ))
                .await
                .map_err(Error::Database)?;
            copy.send(measure_csv.as_bytes()).await.map_err(Error::Database)?;
            copy.finish().await.map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;
        debug!(
            row_count = written,
            measures = measure_csv.rows(),
            "Inserted points"
        );
        Ok(written)
    }

    #[instrument(skip(self, measures), fields(subsystem = "database", db_table = "measures", batch_size = measures.len()))]
    async fn update_measures(&self, measures: &[MeasureRecord]) -> Result<u64> {
        if measures.is_empty() {
            return Ok(0);
        }
        let csv = encode_measure_updates(measures)?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(CREATE_UPDATE_STAGING)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let mut copy = tx
            .copy_in_raw(&format!(
                "COPY measure_updates ({}) FROM STDIN WITH (FORMAT csv)",
                MEASURE_UPDATE_COLUMNS
            ))
            .await
            .map_err(Error::Database)?;
        copy.send(csv.as_bytes()).await.map_err(Error::Database)?;
        copy.finish().await.map_err(Error::Database)?;

        let updated = sqlx::query(APPLY_UPDATES)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?
            .rows_affected();

        tx.commit().await.map_err(Error::Database)?;
        debug!(row_count = updated, "Updated measures");
        Ok(updated)
    }
}
