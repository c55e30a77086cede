//! EuRoC MAV dataset loader.
//!
//! Walks the `mav0` layout: per-camera image lists (`camN/data.csv`) with the
//! PNGs under `camN/data/`, the IMU stream in `imu0/data.csv`, and the
//! calibration in each sensor's `sensor.yaml`.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use nalgebra::{Matrix4, Vector3};
use serde::Deserialize;

use crate::camera::{CameraModel, DistortionModel, StereoCalibration};
use crate::imu::ImuSample;
use crate::system::messages::StereoFrame;

#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub timestamp: f64,
    pub filename: String,
}

#[derive(Debug)]
pub struct EurocDataset {
    dataset_path: PathBuf,
    pub cam0_entries: Vec<ImageEntry>,
    pub cam1_entries: Vec<ImageEntry>,
    pub imu_entries: Vec<ImuSample>,
    pub calibration: StereoCalibration,
}

impl EurocDataset {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let cam0_entries = load_image_list(root.join("cam0/data.csv"))?;
        let cam1_entries = load_image_list(root.join("cam1/data.csv"))?;

        if cam0_entries.len() != cam1_entries.len() {
            bail!("cam0 and cam1 have different number of frames");
        }

        let imu_entries = load_imu_list(root.join("imu0/data.csv"))?;
        let calibration = load_stereo_calibration(&root)?;

        Ok(Self {
            dataset_path: root,
            cam0_entries,
            cam1_entries,
            imu_entries,
            calibration,
        })
    }

    pub fn len(&self) -> usize {
        self.cam0_entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cam0_entries.is_empty()
    }

    /// Load the stereo pair at `idx` as 8-bit monochrome.
    pub fn stereo_frame(&self, idx: usize) -> Result<StereoFrame> {
        let left_entry = self
            .cam0_entries
            .get(idx)
            .with_context(|| format!("No left frame at index {}", idx))?;
        let right_entry = self
            .cam1_entries
            .get(idx)
            .with_context(|| format!("No right frame at index {}", idx))?;

        let left_path = self
            .dataset_path
            .join("cam0/data")
            .join(&left_entry.filename);
        let right_path = self
            .dataset_path
            .join("cam1/data")
            .join(&right_entry.filename);

        let cam0 = image::open(&left_path)
            .with_context(|| format!("Failed to read left image {:?}", left_path))?
            .into_luma8();
        let cam1 = image::open(&right_path)
            .with_context(|| format!("Failed to read right image {:?}", right_path))?
            .into_luma8();

        Ok(StereoFrame {
            timestamp: left_entry.timestamp,
            cam0,
            cam1,
        })
    }
}

fn load_image_list(csv_path: PathBuf) -> Result<Vec<ImageEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(&csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 2 {
            continue;
        }
        let ts_ns: u64 = rec[0].trim().parse()?;
        entries.push(ImageEntry {
            timestamp: ts_ns as f64 * 1e-9,
            filename: rec[1].trim().to_string(),
        });
    }
    Ok(entries)
}

fn load_imu_list(csv_path: PathBuf) -> Result<Vec<ImuSample>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(&csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        // timestamp, w_x, w_y, w_z, a_x, a_y, a_z
        if rec.len() < 7 {
            continue;
        }
        let ts_ns: u64 = rec[0].trim().parse()?;
        let angular_velocity = Vector3::new(
            rec[1].trim().parse()?,
            rec[2].trim().parse()?,
            rec[3].trim().parse()?,
        );
        let linear_acceleration = Vector3::new(
            rec[4].trim().parse()?,
            rec[5].trim().parse()?,
            rec[6].trim().parse()?,
        );
        entries.push(ImuSample {
            timestamp: ts_ns as f64 * 1e-9,
            angular_velocity,
            linear_acceleration,
        });
    }
    Ok(entries)
}

/// EuRoC T_BS transform block: flattened row-major 4x4.
#[derive(Debug, Deserialize)]
struct TransformYaml {
    data: Vec<f64>,
}

/// EuRoC camera sensor.yaml.
#[derive(Debug, Deserialize)]
struct CameraYaml {
    #[serde(rename = "T_BS")]
    t_bs: TransformYaml,
    resolution: Vec<u32>,
    /// [fx, fy, cx, cy]
    intrinsics: Vec<f64>,
    distortion_model: String,
    distortion_coefficients: Vec<f64>,
}

fn load_stereo_calibration(root: &Path) -> Result<StereoCalibration> {
    let cam0_yaml: CameraYaml = read_sensor_yaml(&root.join("cam0/sensor.yaml"))?;
    let cam1_yaml: CameraYaml = read_sensor_yaml(&root.join("cam1/sensor.yaml"))?;

    let cam0 = camera_from_yaml(&cam0_yaml)?;
    let cam1 = camera_from_yaml(&cam1_yaml)?;

    // T_BS maps the sensor frame into the body (IMU) frame; the front-end
    // wants the opposite direction plus the cam0 -> cam1 transform.
    let t_body_cam0 = transform_from(&cam0_yaml.t_bs.data)?;
    let t_body_cam1 = transform_from(&cam1_yaml.t_bs.data)?;
    let t_imu_cam0 = invert_transform(&t_body_cam0);
    let t_cam0_cam1 = invert_transform(&t_body_cam1) * t_body_cam0;

    Ok(StereoCalibration::new(cam0, cam1, &t_imu_cam0, &t_cam0_cam1))
}

fn read_sensor_yaml(path: &Path) -> Result<CameraYaml> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    serde_yaml::from_reader(file).with_context(|| format!("Failed to parse {:?}", path))
}

fn camera_from_yaml(yaml: &CameraYaml) -> Result<CameraModel> {
    if yaml.resolution.len() != 2 {
        bail!("Expected [width, height] resolution, got {:?}", yaml.resolution);
    }
    if yaml.intrinsics.len() != 4 {
        bail!(
            "Expected 4 intrinsics [fx, fy, cx, cy], got {}",
            yaml.intrinsics.len()
        );
    }
    if yaml.distortion_coefficients.len() != 4 {
        bail!(
            "Expected 4 distortion coefficients, got {}",
            yaml.distortion_coefficients.len()
        );
    }

    Ok(CameraModel::new(
        yaml.resolution[0],
        yaml.resolution[1],
        [
            yaml.intrinsics[0],
            yaml.intrinsics[1],
            yaml.intrinsics[2],
            yaml.intrinsics[3],
        ],
        DistortionModel::from_tag(&yaml.distortion_model),
        [
            yaml.distortion_coefficients[0],
            yaml.distortion_coefficients[1],
            yaml.distortion_coefficients[2],
            yaml.distortion_coefficients[3],
        ],
    ))
}

fn transform_from(data: &[f64]) -> Result<Matrix4<f64>> {
    if data.len() != 16 {
        bail!("Expected 16 elements for transform, got {}", data.len());
    }
    Ok(Matrix4::from_row_slice(data))
}

/// Invert a rigid transform without a general matrix inverse.
fn invert_transform(t: &Matrix4<f64>) -> Matrix4<f64> {
    let r = t.fixed_view::<3, 3>(0, 0).into_owned();
    let translation = t.fixed_view::<3, 1>(0, 3).into_owned();
    let r_inv = r.transpose();
    let t_inv = -r_inv * translation;

    let mut out = Matrix4::identity();
    out.fixed_view_mut::<3, 3>(0, 0).copy_from(&r_inv);
    out.fixed_view_mut::<3, 1>(0, 3).copy_from(&t_inv);
    out
}
