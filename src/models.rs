//! Built-in model catalogue.
//!
//! URL layouts of the public NOAA and ECMWF archives. Settings files can
//! add models or replace individual providers on top of this.

use chrono::{Duration, TimeZone, Utc};

use crate::error::Result;
use crate::inventory::IndexGrammar;
use crate::registry::{Availability, ModelDef, Provider, Registry};
use crate::template::PathTemplate;

/// Only admitted for cycles from before a layout change, so it can go first.
const AWS_OLD_LAYOUT: u32 = 0;
const AWS: u32 = 1;
const NOMADS: u32 = 2;
const GOOGLE: u32 = 3;
const AZURE: u32 = 4;
const PANDO: u32 = 5;
const PANDO2: u32 = 6;

/// NOMADS only keeps the most recent days of output.
const NOMADS_RETENTION_DAYS: i64 = 14;

fn idx_provider(name: &str, rank: u32, data: &str) -> Result<Provider> {
    Ok(Provider::new(name, PathTemplate::parse(data)?)
        .with_index(PathTemplate::parse("{data_url}.idx")?, IndexGrammar::Wgrib2)
        .rank(rank))
}

fn nomads(data: &str) -> Result<Provider> {
    Ok(idx_provider("nomads", NOMADS, data)?.availability(Availability::Recent {
        max_age: Duration::days(NOMADS_RETENTION_DAYS),
    }))
}

impl Registry {
    /// Registry holding every built-in model.
    pub fn builtin() -> Result<Self> {
        let mut r = Registry::new();
        for model in [
            hrrr()?,
            hrrrak()?,
            rap()?,
            gfs()?,
            gfs_wave()?,
            nam()?,
            gefs()?,
            rrfs()?,
            rtma()?,
            rtma_ak()?,
            navgem()?,
            ecmwf()?,
        ] {
            r.register(model);
        }
        Ok(r)
    }
}

fn hrrr() -> Result<ModelDef> {
    let file = "hrrr.{yyyymmdd}/conus/hrrr.t{HH}z.wrf{product}f{fxx:02}.grib2";
    let pando = "{model}/{product}/{yyyymmdd}/{model}.t{HH}z.wrf{product}f{fxx:02}.grib2";
    Ok(ModelDef::new("hrrr", "High-Resolution Rapid Refresh - CONUS")
        .product("sfc", "2D surface level fields; 3-km resolution")
        .product("prs", "3D pressure level fields; 3-km resolution")
        .product("nat", "Native level fields; 3-km resolution")
        .product("subh", "Subhourly grids; 3-km resolution")
        .interval(1)
        .provider(idx_provider(
            "aws",
            AWS,
            &format!("https://noaa-hrrr-bdp-pds.s3.amazonaws.com/{file}"),
        )?)
        .provider(nomads(&format!(
            "https://nomads.ncep.noaa.gov/pub/data/nccf/com/hrrr/prod/{file}"
        ))?)
        .provider(idx_provider(
            "google",
            GOOGLE,
            &format!("https://storage.googleapis.com/high-resolution-rapid-refresh/{file}"),
        )?)
        .provider(idx_provider(
            "azure",
            AZURE,
            &format!("https://noaahrrr.blob.core.windows.net/hrrr/{file}"),
        )?)
        .provider(idx_provider(
            "pando",
            PANDO,
            &format!("https://pando-rgw01.chpc.utah.edu/{pando}"),
        )?)
        .provider(idx_provider(
            "pando2",
            PANDO2,
            &format!("https://pando-rgw02.chpc.utah.edu/{pando}"),
        )?))
}

fn hrrrak() -> Result<ModelDef> {
    let file = "hrrr.{yyyymmdd}/alaska/hrrr.t{HH}z.wrf{product}f{fxx:02}.ak.grib2";
    Ok(ModelDef::new("hrrrak", "High-Resolution Rapid Refresh - Alaska")
        .alias("alaska")
        .product("prs", "3D pressure level fields; 3-km resolution")
        .product("sfc", "2D surface level fields; 3-km resolution")
        .product("nat", "Native level fields; 3-km resolution")
        .product("subh", "Subhourly grids; 3-km resolution")
        .interval(3)
        .provider(idx_provider(
            "aws",
            AWS,
            &format!("https://noaa-hrrr-bdp-pds.s3.amazonaws.com/{file}"),
        )?)
        .provider(nomads(&format!(
            "https://nomads.ncep.noaa.gov/pub/data/nccf/com/hrrr/prod/{file}"
        ))?)
        .provider(idx_provider(
            "google",
            GOOGLE,
            &format!("https://storage.googleapis.com/high-resolution-rapid-refresh/{file}"),
        )?)
        .provider(idx_provider(
            "azure",
            AZURE,
            &format!("https://noaahrrr.blob.core.windows.net/hrrr/{file}"),
        )?))
}

fn rap() -> Result<ModelDef> {
    let file = "rap.{yyyymmdd}/rap.t{HH}z.{product}f{fxx:02}.grib2";
    let mut m = ModelDef::new("rap", "Rapid Refresh").interval(1);
    for (name, description) in [
        ("awp130pgrb", "CONUS Pressure levels; 13-km resolution"),
        ("awp252pgrb", "CONUS Pressure levels; 20-km resolution"),
        ("awp236pgrb", "CONUS Pressure levels; 40-km resolution"),
        ("awp130bgrb", "CONUS Native levels; 13-km resolution"),
        ("awp252bgrb", "CONUS Native levels; 20-km resolution"),
        ("wrfprs", "Full domain Pressure Levels; 13-km"),
        ("wrfnat", "Full domain Native Levels; 13-km"),
        ("awip32", "NOAMHI - High-Resolution North American Master Grid; 32-km resolution"),
        ("awp242", "Alaska Quadruple Resolution Pressure levels; 11-km resolution"),
        ("awp200", "Puerto Rico Pressure levels; 16-km resolution"),
        ("awp243", "Eastern North America Pressure levels, 0.4 degree resolution"),
        ("wrfmsl", "WRFMSL; 13-km resolution"),
    ] {
        m = m.product(name, description);
    }
    Ok(m
        .provider(idx_provider(
            "aws",
            AWS,
            &format!("https://noaa-rap-pds.s3.amazonaws.com/{file}"),
        )?)
        .provider(nomads(&format!(
            "https://nomads.ncep.noaa.gov/pub/data/nccf/com/rap/prod/{file}"
        ))?)
        .provider(idx_provider(
            "google",
            GOOGLE,
            &format!("https://storage.googleapis.com/rapid-refresh/{file}"),
        )?)
        .provider(idx_provider(
            "azure",
            AZURE,
            &format!("https://noaarap.blob.core.windows.net/rap/{file}"),
        )?))
}

fn gfs() -> Result<ModelDef> {
    let file = "gfs.{yyyymmdd}/{HH}/atmos/gfs.t{HH}z.{product}.f{fxx:03}";
    // before the atmos/ directory was introduced
    let atmos_since = Utc.with_ymd_and_hms(2021, 3, 22, 0, 0, 0).single();

    let mut m = ModelDef::new("gfs", "Global Forecast System")
        .product("pgrb2.0p25", "common fields, 0.25 degree resolution")
        .product("pgrb2.0p50", "common fields, 0.50 degree resolution")
        .product("pgrb2.1p00", "common fields, 1.00 degree resolution")
        .product("pgrb2b.0p25", "uncommon fields, 0.25 degree resolution")
        .product("pgrb2b.0p50", "uncommon fields, 0.50 degree resolution")
        .product("pgrb2b.1p00", "uncommon fields, 1.00 degree resolution")
        .product("pgrb2full.0p50", "combined grids of 0.50 resolution")
        .provider(idx_provider(
            "aws",
            AWS,
            &format!("https://noaa-gfs-bdp-pds.s3.amazonaws.com/{file}"),
        )?)
        .provider(nomads(&format!(
            "https://nomads.ncep.noaa.gov/pub/data/nccf/com/gfs/prod/{file}"
        ))?)
        .provider(idx_provider(
            "google",
            GOOGLE,
            &format!("https://storage.googleapis.com/global-forecast-system/{file}"),
        )?)
        .provider(idx_provider(
            "azure",
            AZURE,
            &format!("https://noaagfs.blob.core.windows.net/gfs/{file}"),
        )?);

    if let Some(since) = atmos_since {
        m = m.provider(
            idx_provider(
                "aws-old",
                AWS_OLD_LAYOUT,
                "https://noaa-gfs-bdp-pds.s3.amazonaws.com/gfs.{yyyymmdd}/{HH}/gfs.t{HH}z.{product}.f{fxx:03}",
            )?
            .availability(Availability::Until(since)),
        );
    }
    Ok(m)
}

fn gfs_wave() -> Result<ModelDef> {
    let file = "gfs.{yyyymmdd}/{HH}/wave/gridded/gfswave.t{HH}z.{product}.f{fxx:03}.grib2";
    Ok(ModelDef::new("gfs_wave", "Global Forecast System - Wave Products")
        .product("global.0p25", "Global; 0.25 deg resolution")
        .product("global.0p16", "Global; 0.16 deg resolution")
        .product("arctic.9km", "Arctic; 9-km resolution")
        .product("atlocn.0p16", "North Atlantic 0.16 deg resolution")
        .product("epacif.0p16", "Eastern Pacific; .16 deg resolution")
        .product("gsouth.0p25", "Global South; 0.25 deg resolution")
        .product("wcoast.0p16", "West Coast; 0.16 deg resolution")
        .provider(idx_provider(
            "aws",
            AWS,
            &format!("https://noaa-gfs-bdp-pds.s3.amazonaws.com/{file}"),
        )?)
        .provider(nomads(&format!(
            "https://nomads.ncep.noaa.gov/pub/data/nccf/com/gfs/prod/{file}"
        ))?)
        .provider(idx_provider(
            "google",
            GOOGLE,
            &format!("https://storage.googleapis.com/global-forecast-system/{file}"),
        )?)
        .provider(idx_provider(
            "azure",
            AZURE,
            &format!("https://noaagfs.blob.core.windows.net/gfs/{file}"),
        )?))
}

fn nam() -> Result<ModelDef> {
    let file = "nam.{yyyymmdd}/nam.t{HH}z.{product}{fxx:02}.tm00.grib2";
    Ok(ModelDef::new("nam", "North America Mesoscale - CONUS")
        .product("conusnest.hiresf", "CONUS 5 km")
        .product("firewxnest.hiresf", "Fire Weather 1.33 km CONUS/1.5 km Alaska")
        .product("alaskanest.hiresf", "Alaska 6 km")
        .product("hawaiinest.hiresf", "Hawaii 6 km")
        .product("priconest.hiresf", "Puerto Rico 3 km")
        .product("afwaca", "Central America/Caribbean")
        .provider(idx_provider(
            "aws",
            AWS,
            &format!("https://noaa-nam-pds.s3.amazonaws.com/{file}"),
        )?)
        .provider(nomads(&format!(
            "https://nomads.ncep.noaa.gov/pub/data/nccf/com/nam/prod/{file}"
        ))?))
}

fn gefs() -> Result<ModelDef> {
    Ok(ModelDef::new("gefs", "Global Ensemble Forecast System")
        .product("pgrb2ap5", "most common variables, 0.5 degree")
        .product("pgrb2bp5", "least common variables, 0.5 degree")
        .product("pgrb2sp25", "common variables, 0.25 degree")
        .product_var("pgrb2ap5", "file", "geavg.t{HH}z.pgrb2a.0p50")
        .product_var("pgrb2bp5", "file", "gec00.t{HH}z.pgrb2b.0p50")
        .product_var("pgrb2sp25", "file", "geavg.t{HH}z.pgrb2s.0p25")
        .provider(
            Provider::new(
                "aws",
                PathTemplate::parse(
                    "https://noaa-gefs-pds.s3.amazonaws.com/gefs.{yyyymmdd}/{HH}/atmos/{product}/{file}.f{fxx:03}",
                )?,
            )
            .with_index(PathTemplate::parse("{data_url}.idx")?, IndexGrammar::Wgrib2)
            .rank(AWS),
        ))
}

fn rrfs() -> Result<ModelDef> {
    let mut m = ModelDef::new("rrfs", "Rapid Refresh Forecast System (RRFS) Ensemble").interval(1);
    for (name, description) in [
        ("mean", "ensemble mean"),
        ("avrg", "ensemble average"),
        ("eas", "ensemble agreement scale"),
        ("ffri", "flash flood and intense rainfall"),
        ("lpmm", "localized probability-matched mean"),
        ("pmmn", "probability-matched mean"),
        ("prob", "ensemble probabilities"),
    ] {
        m = m.product(name, description);
    }
    Ok(m.provider(idx_provider(
        "aws",
        AWS,
        "https://noaa-rrfs-pds.s3.amazonaws.com/rrfs.{yyyymmdd}/{HH}/ensprod/rrfsce.t{HH}z.conus.{product}.f{fxx:02}.grib2",
    )?))
}

fn rtma() -> Result<ModelDef> {
    let file = "rtma2p5.{yyyymmdd}/rtma2p5.t{HH}z.2dvar{product}_ndfd.grb2_wexp";
    Ok(ModelDef::new("rtma", "CONUS Real-Time Mesoscale Analysis (RTMA)")
        .product("anl", "analysis")
        .product("err", "analysis error")
        .product("ges", "first guess")
        .interval(1)
        .provider(
            Provider::new(
                "aws",
                PathTemplate::parse(&format!("https://noaa-rtma-pds.s3.amazonaws.com/{file}"))?,
            )
            .rank(AWS),
        )
        .provider(
            Provider::new(
                "nomads",
                PathTemplate::parse(&format!(
                    "https://nomads.ncep.noaa.gov/pub/data/nccf/com/rtma/prod/{file}"
                ))?,
            )
            .rank(NOMADS)
            .availability(Availability::Recent {
                max_age: Duration::days(NOMADS_RETENTION_DAYS),
            }),
        ))
}

fn rtma_ak() -> Result<ModelDef> {
    let file = "akrtma.{yyyymmdd}/akrtma.t{HH}z.2dvar{product}_ndfd_3p0.grb2";
    Ok(ModelDef::new("rtma_ak", "Alaska Real-Time Mesoscale Analysis (RTMA)")
        .product("anl", "analysis")
        .product("err", "analysis error")
        .product("ges", "first guess")
        .interval(1)
        .provider(
            Provider::new(
                "aws",
                PathTemplate::parse(&format!("https://noaa-rtma-pds.s3.amazonaws.com/{file}"))?,
            )
            .rank(AWS),
        )
        .provider(
            Provider::new(
                "nomads",
                PathTemplate::parse(&format!(
                    "https://nomads.ncep.noaa.gov/pub/data/nccf/com/rtma/prod/{file}"
                ))?,
            )
            .rank(NOMADS)
            .availability(Availability::Recent {
                max_age: Duration::days(NOMADS_RETENTION_DAYS),
            }),
        ))
}

fn navgem() -> Result<ModelDef> {
    Ok(ModelDef::new("navgem", "Navy Global Environment Model")
        .product("none", "")
        .provider(nomads(
            "https://nomads.ncep.noaa.gov/pub/data/nccf/com/fnmoc/prod/navgem.{yyyymmdd}/navgem_{yyyymmddHH}f{fxx:03}.grib2",
        )?))
}

fn ecmwf() -> Result<ModelDef> {
    let path = "{yyyymmdd}/{HH}z/ifs/0p25/{product}/{yyyymmddHHMMSS}-{fxx}h-{product}-{kind}.grib2";
    let provider = |name: &str, rank: u32, base: &str| -> Result<Provider> {
        Ok(Provider::new(name, PathTemplate::parse(&format!("{base}/{path}"))?)
            .with_index(PathTemplate::parse("{data_stem}.index")?, IndexGrammar::Eccodes)
            .rank(rank))
    };

    Ok(ModelDef::new("ecmwf", "ECMWF open data (IFS 0.25 degree)")
        .alias("ifs")
        .product("oper", "operational high-resolution forecast, atmospheric fields")
        .product("enfo", "ensemble forecast, atmospheric fields")
        .product("wave", "wave forecasts")
        .product("waef", "ensemble forecast, ocean wave fields")
        .product_var("oper", "kind", "fc")
        .product_var("wave", "kind", "fc")
        .product_var("enfo", "kind", "ef")
        .product_var("waef", "kind", "ef")
        // 06z/18z runs live under different streams
        .interval(12)
        .provider(provider("aws", AWS, "https://ecmwf-forecasts.s3.eu-central-1.amazonaws.com")?)
        .provider(provider("azure", 2, "https://ai4edataeuwest.blob.core.windows.net/ecmwf")?)
        .provider(provider("google", 3, "https://storage.googleapis.com/ecmwf-open-data")?)
        .provider(
            provider("ecmwf", 4, "https://data.ecmwf.int/forecasts")?
                .availability(Availability::Recent {
                    max_age: Duration::days(4),
                }),
        ))
}
