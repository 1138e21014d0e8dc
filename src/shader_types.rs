use crevice::std140::AsStd140;
use ultraviolet::{projection, Mat4, Vec3};

#[derive(AsStd140)]
pub struct Camera {
    pub view: Mat4,
    pub proj: Mat4,
}

impl Camera {
    pub fn orbit(angle: f32, aspect_ratio: f32) -> Self {
        let eye = Vec3::new(angle.sin() * 3.0, 1.0, angle.cos() * 3.0);
        Self {
            view: Mat4::look_at(eye, Vec3::zero(), Vec3::unit_y()),
            proj: projection::rh_yup::perspective_vk(
                60f32.to_radians(),
                aspect_ratio,
                0.1,
                100.0,
            ),
        }
    }
}
