use std::cell::RefCell;

use glam::Mat4;
use js_sys::{Float32Array, Int32Array, Object, Reflect, Uint32Array, Uint8Array};
use ksplat_lib::decoder::SplatFileType;
use ksplat_lib::load::{load_and_encode, AbortHandle, LoadOptions};
use ksplat_lib::sort::{DistanceSorter, Distances, SortParams, SorterConfig};
use ksplat_lib::splat_buffer::{
    EncodeOptions, SectionHeader, SplatBufferHeader, HEADER_SIZE_BYTES, SECTION_HEADER_SIZE_BYTES,
};
use wasm_bindgen::prelude::*;

#[wasm_bindgen(start)]
pub fn wasm_start() {
    console_error_panic_hook::set_once();
}

fn log_console(message: &str) {
    web_sys::console::log_1(&JsValue::from_str(message));
}

fn to_js_err(err: impl std::fmt::Display) -> JsValue {
    JsValue::from(err.to_string())
}

#[derive(Default)]
struct SortState {
    sorter: Option<DistanceSorter>,
    indexes: Vec<u32>,
    float_distances: Vec<f32>,
    int_distances: Vec<i32>,
}

impl SortState {
    fn ensure_size(&mut self, count: usize) {
        if self.indexes.len() < count {
            self.indexes.resize(count, 0);
        }
    }
}

thread_local! {
    static SORT_STATE: RefCell<SortState> = RefCell::new(SortState::default());
}

/// Allocate the sorter. `config` is a `SorterConfig` object, missing fields
/// take their defaults.
#[wasm_bindgen]
pub fn init_sorter(config: JsValue) -> Result<(), JsValue> {
    let config: SorterConfig = if config.is_falsy() {
        SorterConfig::default()
    } else {
        serde_wasm_bindgen::from_value(config)?
    };
    let sorter = DistanceSorter::new(config).map_err(to_js_err)?;
    SORT_STATE.with_borrow_mut(|state| {
        let max_splat_count = sorter.config().max_splat_count;
        state.ensure_size(max_splat_count);
        state.sorter = Some(sorter);
        log_console(&format!("ksplat sorter ready for {} splats", max_splat_count));
    });
    Ok(())
}

/// Centers as 4 floats per splat, optionally with per-splat scene indexes.
#[wasm_bindgen]
pub fn upload_centers(centers: Float32Array, scene_indexes: Option<Uint32Array>) -> Result<(), JsValue> {
    SORT_STATE.with_borrow_mut(|state| {
        let sorter = state.sorter.as_mut().ok_or_else(|| to_js_err("Sorter not initialized"))?;
        sorter.set_centers(&centers.to_vec(), 4).map_err(to_js_err)?;
        if let Some(scene_indexes) = scene_indexes {
            sorter.set_scene_indexes(&scene_indexes.to_vec());
        }
        Ok(())
    })
}

/// Column-major 4x4 matrices, 16 floats per scene.
#[wasm_bindgen]
pub fn upload_transforms(transforms: Float32Array) -> Result<(), JsValue> {
    let values = transforms.to_vec();
    if values.len() % 16 != 0 {
        return Err(to_js_err("Transforms must be 16 floats each"));
    }
    let transforms: Vec<Mat4> = values.chunks_exact(16).map(Mat4::from_cols_slice).collect();
    SORT_STATE.with_borrow_mut(|state| {
        let sorter = state.sorter.as_mut().ok_or_else(|| to_js_err("Sorter not initialized"))?;
        sorter.set_transforms(&transforms);
        Ok(())
    })
}

/// Sort the tail of `indexes_to_sort` and write the first `render_count`
/// entries of the result into `ordering`. Returns `render_count`.
#[wasm_bindgen]
pub fn sort_splats(
    view_proj: Float32Array,
    indexes_to_sort: Uint32Array,
    render_count: u32,
    sort_count: u32,
    ordering: Uint32Array,
    float_distances: Option<Float32Array>,
    int_distances: Option<Int32Array>,
) -> Result<u32, JsValue> {
    let view_proj = view_proj.to_vec();
    if view_proj.len() != 16 {
        return Err(to_js_err("View-projection must be 16 floats"));
    }
    let view_proj = Mat4::from_cols_slice(&view_proj);
    if render_count > indexes_to_sort.length() || render_count > ordering.length() {
        return Err(to_js_err("Render count exceeds provided arrays"));
    }

    SORT_STATE.with_borrow_mut(|state| {
        let render = render_count as usize;
        state.ensure_size(render);
        indexes_to_sort.subarray(0, render_count).copy_to(&mut state.indexes[..render]);

        let precomputed = if let Some(distances) = float_distances {
            state.float_distances.resize(distances.length() as usize, 0.0);
            distances.copy_to(&mut state.float_distances);
            Some(Distances::Float(&state.float_distances))
        } else if let Some(distances) = int_distances {
            state.int_distances.resize(distances.length() as usize, 0);
            distances.copy_to(&mut state.int_distances);
            Some(Distances::Int(&state.int_distances))
        } else {
            None
        };

        let sorter = state.sorter.as_mut().ok_or_else(|| to_js_err("Sorter not initialized"))?;
        let params = SortParams {
            view_proj,
            indexes_to_sort: &state.indexes[..render],
            render_count: render,
            sort_count: sort_count as usize,
            precomputed,
        };
        let sorted = sorter.sort(&params).map_err(to_js_err)?;
        if !sorted.is_empty() {
            ordering.subarray(0, render_count).copy_from(sorted);
        }
        Ok(render_count)
    })
}

/// Parse the global and section headers of a `.ksplat` prefix. Returns null
/// until enough bytes are present.
#[wasm_bindgen]
pub fn decode_ksplat_header(bytes: Uint8Array) -> Result<JsValue, JsValue> {
    let bytes = bytes.to_vec();
    if bytes.len() < HEADER_SIZE_BYTES {
        return Ok(JsValue::null());
    }
    let header = SplatBufferHeader::read(&bytes).map_err(to_js_err)?;
    let sections_end = HEADER_SIZE_BYTES + header.max_section_count as usize * SECTION_HEADER_SIZE_BYTES;
    if bytes.len() < sections_end {
        return Ok(JsValue::null());
    }
    let sections = bytes[HEADER_SIZE_BYTES..sections_end]
        .chunks_exact(SECTION_HEADER_SIZE_BYTES)
        .map(|chunk| SectionHeader::read(chunk, header.compression_level))
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(to_js_err)?;

    let object = Object::new();
    Reflect::set(&object, &JsValue::from_str("header"), &serde_wasm_bindgen::to_value(&header)?)?;
    Reflect::set(&object, &JsValue::from_str("sections"), &serde_wasm_bindgen::to_value(&sections)?)?;
    Reflect::set(&object, &JsValue::from_str("dataStart"), &JsValue::from_f64(sections_end as f64))?;
    Ok(JsValue::from(object))
}

/// Convert a whole `.ply`, `.splat` or `.ksplat` file to `.ksplat` bytes.
/// `options` is an `EncodeOptions` object.
#[wasm_bindgen]
pub fn generate_ksplat(
    bytes: Uint8Array,
    file_type: Option<String>,
    path_name: Option<String>,
    options: JsValue,
) -> Result<Uint8Array, JsValue> {
    let encode: EncodeOptions = if options.is_falsy() {
        EncodeOptions::default()
    } else {
        serde_wasm_bindgen::from_value(options)?
    };
    let file_type = match file_type {
        Some(file_type) => Some(SplatFileType::from_enum_str(&file_type).map_err(to_js_err)?),
        None => None,
    };

    let bytes = bytes.to_vec();
    let load_options = LoadOptions { file_type, path_name, total_bytes: Some(bytes.len()), ..Default::default() };
    let buffer = load_and_encode(bytes.as_slice(), &load_options, &encode, &AbortHandle::new()).map_err(to_js_err)?;
    log_console(&format!(
        "ksplat: encoded {} splats at level {}",
        buffer.splat_count(),
        buffer.compression_level().as_u16()
    ));
    Ok(Uint8Array::from(buffer.to_bytes().as_slice()))
}
