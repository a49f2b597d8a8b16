use math::vector::{Vector2D, Vector3D};

// how far each triangle vertex is pushed outwards before the inclusion test,
// so that points lying on a shared edge are claimed by the first triangle tested
const TRIANGLE_VERTEX_NUDGE: f32 = 0.01;

/// Plane in the form `a*x + b*y + c*z + d = 0`.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Plane {
    a: f32,
    b: f32,
    c: f32,
    d: f32,
}

impl Plane {
    /// The three points must not be aligned on the XY projection, otherwise
    /// `c` is zero and the plane has no height function.
    pub fn from_points(v1: Vector3D, v2: Vector3D, v3: Vector3D) -> Self {
        let normal = (v2 - v1).cross(&(v3 - v1));
        let d = -normal.dot(&v1);
        Plane {
            a: normal.get_x(),
            b: normal.get_y(),
            c: normal.get_z(),
            d,
        }
    }

    pub fn get_height(&self, x: f32, y: f32) -> f32 {
        (self.a * x + self.b * y + self.d) / -self.c
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Triangle {
    vertices: [Vector2D; 3],
}

impl Triangle {
    pub fn new(v1: Vector2D, v2: Vector2D, v3: Vector2D) -> Self {
        Triangle {
            vertices: [v1, v2, v3],
        }
    }

    pub fn get_vertices(&self) -> [Vector2D; 3] {
        self.vertices
    }

    // every vertex is moved relative to the unmoved other two
    fn get_nudged_vertices(&self) -> [Vector2D; 3] {
        let [v1, v2, v3] = self.vertices;
        [nudge(v1, v2, v3), nudge(v2, v1, v3), nudge(v3, v1, v2)]
    }

    pub fn contains(&self, point: Vector2D) -> bool {
        let [v1, v2, v3] = self.get_nudged_vertices();

        let b1 = sign(point, v1, v2) < 0.0;
        let b2 = sign(point, v2, v3) < 0.0;
        let b3 = sign(point, v3, v1) < 0.0;
        b1 == b2 && b2 == b3
    }
}

// moves `vertex` along the bisector of its two edges, away from the opposite side
fn nudge(vertex: Vector2D, other1: Vector2D, other2: Vector2D) -> Vector2D {
    let direction = ((vertex - other1) + (vertex - other2)).normalize();
    vertex + direction * TRIANGLE_VERTEX_NUDGE
}

fn sign(p1: Vector2D, p2: Vector2D, p3: Vector2D) -> f32 {
    (p1.get_x() - p3.get_x()) * (p2.get_y() - p3.get_y())
        - (p2.get_x() - p3.get_x()) * (p1.get_y() - p3.get_y())
}
