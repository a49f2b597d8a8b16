use math::vector::{Vector2D, Vector3D};

use crate::plane::{Plane, Triangle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum BedCorner {
    BackLeft,
    BackRight,
    FrontLeft,
    FrontRight,
}

impl BedCorner {
    pub const ALL: [BedCorner; 4] = [
        BedCorner::BackLeft,
        BedCorner::BackRight,
        BedCorner::FrontLeft,
        BedCorner::FrontRight,
    ];

    pub fn index(&self) -> usize {
        match self {
            BedCorner::BackLeft => 0,
            BedCorner::BackRight => 1,
            BedCorner::FrontLeft => 2,
            BedCorner::FrontRight => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum BedPlane {
    Back,
    Left,
    Right,
    Front,
}

impl BedPlane {
    pub const ALL: [BedPlane; 4] = [BedPlane::Back, BedPlane::Left, BedPlane::Right, BedPlane::Front];

    pub fn index(&self) -> usize {
        match self {
            BedPlane::Back => 0,
            BedPlane::Left => 1,
            BedPlane::Right => 2,
            BedPlane::Front => 3,
        }
    }

    // every plane is spanned by two adjacent corners and the center
    pub fn get_corners(&self) -> (BedCorner, BedCorner) {
        match self {
            BedPlane::Back => (BedCorner::BackLeft, BedCorner::BackRight),
            BedPlane::Left => (BedCorner::BackLeft, BedCorner::FrontLeft),
            BedPlane::Right => (BedCorner::BackRight, BedCorner::FrontRight),
            BedPlane::Front => (BedCorner::FrontLeft, BedCorner::FrontRight),
        }
    }
}

/// The branch of the height function a bed position falls into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum BedRegion {
    BackLeftCorner,
    FrontLeftCorner,
    FrontRightCorner,
    BackRightCorner,
    LeftEdge,
    RightEdge,
    BackEdge,
    FrontEdge,
    Interior(BedPlane),
}

/// Where the probed corners and the center datum sit on the bed, in mm.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BedLayout {
    pub back_left: Vector2D,
    pub back_right: Vector2D,
    pub front_left: Vector2D,
    pub front_right: Vector2D,
    pub center: Vector2D,
}

impl Default for BedLayout {
    fn default() -> Self {
        Self {
            back_left: Vector2D::new(9.0, 95.0),
            back_right: Vector2D::new(99.0, 95.0),
            front_left: Vector2D::new(9.0, 5.0),
            front_right: Vector2D::new(99.0, 5.0),
            center: Vector2D::new(54.0, 50.0),
        }
    }
}

impl BedLayout {
    pub fn get_corner(&self, corner: BedCorner) -> Vector2D {
        match corner {
            BedCorner::BackLeft => self.back_left,
            BedCorner::BackRight => self.back_right,
            BedCorner::FrontLeft => self.front_left,
            BedCorner::FrontRight => self.front_right,
        }
    }

    fn get_triangle(&self, plane: BedPlane) -> Triangle {
        let (a, b) = plane.get_corners();
        Triangle::new(self.center, self.get_corner(a), self.get_corner(b))
    }

    pub fn get_region(&self, x: f32, y: f32) -> BedRegion {
        let left = x <= self.front_left.get_x();
        let right = x >= self.front_right.get_x();
        let back = y >= self.back_right.get_y();
        let front = y <= self.front_left.get_y();

        if left && back {
            BedRegion::BackLeftCorner
        } else if left && front {
            BedRegion::FrontLeftCorner
        } else if right && front {
            BedRegion::FrontRightCorner
        } else if right && back {
            BedRegion::BackRightCorner
        } else if left {
            BedRegion::LeftEdge
        } else if right {
            BedRegion::RightEdge
        } else if back {
            BedRegion::BackEdge
        } else if front {
            BedRegion::FrontEdge
        } else {
            let point = Vector2D::new(x, y);
            let plane = [BedPlane::Left, BedPlane::Right, BedPlane::Back]
                .into_iter()
                .find(|plane| self.get_triangle(*plane).contains(point))
                .unwrap_or(BedPlane::Front);
            BedRegion::Interior(plane)
        }
    }
}

/// Height correction of the bed surface, built from four probed corner
/// heights and the center, which is the datum (height 0).
///
/// Every `(x, y)` maps to one plane or to the average of the two planes
/// meeting at a corner, see [`BedLayout::get_region`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BedGeometry {
    layout: BedLayout,
    heights: [f32; 4],
    planes: [Plane; 4],
}

impl BedGeometry {
    pub fn new(layout: BedLayout, heights: [f32; 4]) -> Self {
        let mut geometry = BedGeometry {
            layout,
            heights,
            planes: [Plane::default(); 4],
        };
        geometry.update_planes();
        geometry
    }

    pub fn flat(layout: BedLayout) -> Self {
        Self::new(layout, [0.0; 4])
    }

    pub fn get_layout(&self) -> &BedLayout {
        &self.layout
    }

    pub fn get_corner_height(&self, corner: BedCorner) -> f32 {
        self.heights[corner.index()]
    }

    pub fn set_corner_height(&mut self, corner: BedCorner, height: f32) {
        self.heights[corner.index()] = height;
        self.update_planes();
    }

    pub fn get_plane(&self, plane: BedPlane) -> &Plane {
        &self.planes[plane.index()]
    }

    fn update_planes(&mut self) {
        let center = Vector3D::new(self.layout.center.get_x(), self.layout.center.get_y(), 0.0);
        for plane in BedPlane::ALL {
            let (a, b) = plane.get_corners();
            self.planes[plane.index()] = Plane::from_points(self.get_vertex(a), self.get_vertex(b), center);
        }
    }

    fn get_vertex(&self, corner: BedCorner) -> Vector3D {
        let position = self.layout.get_corner(corner);
        Vector3D::new(position.get_x(), position.get_y(), self.get_corner_height(corner))
    }

    pub fn get_region(&self, x: f32, y: f32) -> BedRegion {
        self.layout.get_region(x, y)
    }

    pub fn get_height_adjustment(&self, x: f32, y: f32) -> f32 {
        let height = |plane: BedPlane| self.get_plane(plane).get_height(x, y);
        let average = |a: BedPlane, b: BedPlane| (height(a) + height(b)) / 2.0;

        match self.get_region(x, y) {
            BedRegion::BackLeftCorner => average(BedPlane::Back, BedPlane::Left),
            BedRegion::FrontLeftCorner => average(BedPlane::Front, BedPlane::Left),
            BedRegion::FrontRightCorner => average(BedPlane::Front, BedPlane::Right),
            BedRegion::BackRightCorner => average(BedPlane::Back, BedPlane::Right),
            BedRegion::LeftEdge => height(BedPlane::Left),
            BedRegion::RightEdge => height(BedPlane::Right),
            BedRegion::BackEdge => height(BedPlane::Back),
            BedRegion::FrontEdge => height(BedPlane::Front),
            BedRegion::Interior(plane) => height(plane),
        }
    }
}
